//! Line-delimited JSON log with rotation
//!
//! The active file is `<path>`; rotated generations are `<path>.1` (newest)
//! up to `<path>.N` (oldest).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{LogQuery, LogRecord, LogStore, StoreError};

/// Rotation limits; 0 disables a limit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Rotate before the active file would exceed this size
    pub max_bytes: u64,
    /// Rotated generations kept
    pub max_files: usize,
    /// Rotate an active file older than this, drop rotated files older than this
    pub max_age_secs: u64,
}

impl RotationConfig {
    fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }
}

struct ActiveFile {
    opened_at: SystemTime,
    closed: bool,
}

pub struct JsonlLogStore {
    path: PathBuf,
    rotation: RotationConfig,
    active: Mutex<ActiveFile>,
}

impl JsonlLogStore {
    pub async fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let opened_at = match fs::metadata(&path).await {
            Ok(meta) => meta.modified().unwrap_or_else(|_| SystemTime::now()),
            Err(_) => SystemTime::now(),
        };
        tracing::info!(path = %path.display(), "jsonl log store opened");
        Ok(Self {
            path,
            rotation,
            active: Mutex::new(ActiveFile {
                opened_at,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    /// Existing rotated generations, oldest first
    async fn rotated_files(&self) -> Vec<(usize, PathBuf)> {
        let mut found = Vec::new();
        let mut n = 1;
        loop {
            let p = self.generation(n);
            if fs::try_exists(&p).await.unwrap_or(false) {
                found.push((n, p));
                n += 1;
            } else {
                break;
            }
        }
        found.reverse();
        found
    }

    fn needs_rotation(&self, active: &ActiveFile, current_len: u64, incoming: u64) -> bool {
        let too_big = self.rotation.max_bytes > 0
            && current_len > 0
            && current_len + incoming > self.rotation.max_bytes;
        let too_old = self.rotation.max_age().is_some_and(|max_age| {
            current_len > 0
                && active
                    .opened_at
                    .elapsed()
                    .map(|age| age > max_age)
                    .unwrap_or(false)
        });
        too_big || too_old
    }

    async fn rotate(&self, active: &mut ActiveFile) -> Result<(), StoreError> {
        let generations = self.rotated_files().await;
        // oldest first, so renames never overwrite
        for (n, path) in &generations {
            fs::rename(path, self.generation(n + 1)).await?;
        }
        fs::rename(&self.path, self.generation(1)).await?;
        active.opened_at = SystemTime::now();
        self.prune().await?;
        tracing::info!(path = %self.path.display(), "log rotated");
        Ok(())
    }

    async fn prune(&self) -> Result<(), StoreError> {
        let max_age = self.rotation.max_age();
        for (n, path) in self.rotated_files().await {
            let over_count = self.rotation.max_files > 0 && n > self.rotation.max_files;
            let over_age = match max_age {
                Some(max_age) => fs::metadata(&path)
                    .await?
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .is_some_and(|age| age > max_age),
                None => false,
            };
            if over_count || over_age {
                fs::remove_file(&path).await?;
                tracing::debug!(path = %path.display(), "rotated log removed");
            }
        }
        Ok(())
    }

    /// Open every generation, oldest first, together with its length.
    ///
    /// Held handles survive later renames, so reading can happen after the
    /// append lock is released. Bytes appended afterwards are not read.
    async fn snapshot(&self) -> Vec<Snapshot> {
        let _guard = self.active.lock().await;
        let mut paths: Vec<PathBuf> = self.rotated_files().await.into_iter().map(|(_, p)| p).collect();
        paths.push(self.path.clone());

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let opened = match fs::File::open(&path).await {
                Ok(file) => file.metadata().await.map(|meta| (file, meta.len())),
                Err(e) => Err(e),
            };
            match opened {
                Ok((file, len)) => files.push(Snapshot { path, file, len }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "unreadable log file"),
            }
        }
        files
    }

    async fn read_matching(snapshot: Snapshot, query: &LogQuery, out: &mut Vec<LogRecord>) {
        let Snapshot { path, file, len } = snapshot;
        let mut content = String::new();
        if let Err(e) = file.take(len).read_to_string(&mut content).await {
            tracing::warn!(path = %path.display(), error = %e, "unreadable log file");
            return;
        }
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) if query.matches(&record) => out.push(record),
                Ok(_) => {}
                Err(e) => tracing::debug!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "skipping malformed log line"
                ),
            }
        }
    }
}

struct Snapshot {
    path: PathBuf,
    file: fs::File,
    len: u64,
}

#[async_trait]
impl LogStore for JsonlLogStore {
    async fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut active = self.active.lock().await;
        if active.closed {
            return Err(StoreError::Closed);
        }
        let current_len = match fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if self.needs_rotation(&active, current_len, line.len() as u64) {
            self.rotate(&mut active).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, StoreError> {
        let mut out = Vec::new();
        for snapshot in self.snapshot().await {
            Self::read_matching(snapshot, query, &mut out).await;
        }
        Ok(out)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.active.lock().await.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SignalKind;
    use crate::repo::tests::record;
    use chrono::{Duration as ChronoDuration, Utc};

    #[tokio::test]
    async fn test_append_and_query_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlLogStore::open(dir.path().join("dispatch.jsonl"), RotationConfig::default())
            .await
            .unwrap();

        let now = Utc::now();
        let r1 = record(SignalKind::Fcr, now, &["v1", "v2"]);
        let r2 = record(SignalKind::Ma, now + ChronoDuration::seconds(5), &["v3"]);
        store.append(&r1).await.unwrap();
        store.append(&r2).await.unwrap();

        let all = store.query(&LogQuery::default()).await.unwrap();
        assert_eq!(all, vec![r1.clone(), r2.clone()]);

        let window = LogQuery {
            from: Some(r1.timestamp),
            to: Some(r1.timestamp + ChronoDuration::milliseconds(1)),
            vehicle_id: Some("v2".into()),
            ..Default::default()
        };
        assert_eq!(store.query(&window).await.unwrap(), vec![r1]);

        let by_kind = LogQuery {
            signal_kind: Some(SignalKind::Ma),
            ..Default::default()
        };
        assert_eq!(store.query(&by_kind).await.unwrap(), vec![r2]);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.jsonl");
        let store = JsonlLogStore::open(&path, RotationConfig::default()).await.unwrap();
        let r = record(SignalKind::Afrr, Utc::now(), &["v1"]);
        store.append(&r).await.unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"{not json\n\n").await.unwrap();
        drop(file);
        store.append(&r).await.unwrap();

        assert_eq!(store.query(&LogQuery::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rotation_by_size_keeps_order_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.jsonl");
        let rotation = RotationConfig {
            max_bytes: 1,
            max_files: 2,
            max_age_secs: 0,
        };
        let store = JsonlLogStore::open(&path, rotation).await.unwrap();

        let base = Utc::now();
        let records: Vec<_> = (0..4)
            .map(|i| record(SignalKind::Ma, base + ChronoDuration::seconds(i), &["v1"]))
            .collect();
        for r in &records {
            store.append(r).await.unwrap();
        }

        // every append after the first rotates; only two generations survive
        assert!(store.generation(1).exists());
        assert!(store.generation(2).exists());
        assert!(!store.generation(3).exists());

        let kept = store.query(&LogQuery::default()).await.unwrap();
        assert_eq!(kept, records[1..].to_vec());
    }

    #[tokio::test]
    async fn test_snapshot_survives_rotation_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let rotation = RotationConfig {
            max_bytes: 1,
            max_files: 5,
            max_age_secs: 0,
        };
        let store = JsonlLogStore::open(dir.path().join("dispatch.jsonl"), rotation)
            .await
            .unwrap();
        let base = Utc::now();
        let first = record(SignalKind::Fcr, base, &["v1"]);
        let second = record(SignalKind::Fcr, base + ChronoDuration::seconds(1), &["v2"]);
        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 2);

        // generations shift under the open handles
        let third = record(SignalKind::Fcr, base + ChronoDuration::seconds(2), &["v3"]);
        store.append(&third).await.unwrap();
        assert!(store.generation(2).exists());

        let mut out = Vec::new();
        for file in snapshot {
            JsonlLogStore::read_matching(file, &LogQuery::default(), &mut out).await;
        }
        assert_eq!(out, vec![first, second]);
    }

    #[tokio::test]
    async fn test_query_does_not_hold_the_append_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlLogStore::open(dir.path().join("dispatch.jsonl"), RotationConfig::default())
            .await
            .unwrap();
        let r = record(SignalKind::Ma, Utc::now(), &["v1"]);
        store.append(&r).await.unwrap();

        let snapshot = store.snapshot().await;
        // the lock is free again while the snapshot is still unread
        assert!(store.active.try_lock().is_ok());
        let mut out = Vec::new();
        for file in snapshot {
            JsonlLogStore::read_matching(file, &LogQuery::default(), &mut out).await;
        }
        assert_eq!(out, vec![r]);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlLogStore::open(dir.path().join("x.jsonl"), RotationConfig::default())
            .await
            .unwrap();
        store.close().await.unwrap();
        let r = record(SignalKind::Ma, Utc::now(), &[]);
        assert!(matches!(store.append(&r).await, Err(StoreError::Closed)));
    }
}
