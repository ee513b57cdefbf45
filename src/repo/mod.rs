//! Dispatch log persistence
//!
//! Every dispatch produces one [`LogRecord`]. Stores are append-only and
//! answer time-window / signal-kind / vehicle queries.

pub mod jsonl;
#[cfg(feature = "db")]
pub mod sqlite;

pub use jsonl::*;
#[cfg(feature = "db")]
pub use sqlite::*;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{Assignment, DispatchResult, FlexibilitySignal, Scores, SignalKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[cfg(feature = "db")]
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store closed")]
    Closed,
}

/// The dispatch outcome part of a log record, errors rendered as text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogResponse {
    pub assignments: Assignment,
    pub fallback_assignments: Assignment,
    pub errors: BTreeMap<String, String>,
    pub acknowledged: BTreeMap<String, bool>,
    pub signal: FlexibilitySignal,
    pub market_price: f64,
    pub scores: Scores,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub signal: FlexibilitySignal,
    pub target_power: f64,
    pub vehicles_selected: Vec<String>,
    pub response: LogResponse,
}

impl LogRecord {
    pub fn from_result(
        result: &DispatchResult,
        vehicles_selected: Vec<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            signal: result.signal.clone(),
            target_power: result.signal.power_kw,
            vehicles_selected,
            response: LogResponse {
                assignments: result.assignments.clone(),
                fallback_assignments: result.fallback_assignments.clone(),
                errors: result
                    .errors
                    .iter()
                    .map(|(id, e)| (id.clone(), e.to_string()))
                    .collect(),
                acknowledged: result.acknowledged.clone(),
                signal: result.signal.clone(),
                market_price: result.market_price,
                scores: result.scores.clone(),
            },
        }
    }

    /// Listed as selected or present in either assignment map
    pub fn involves(&self, vehicle_id: &str) -> bool {
        self.vehicles_selected.iter().any(|v| v == vehicle_id)
            || self.response.assignments.contains_key(vehicle_id)
            || self.response.fallback_assignments.contains_key(vehicle_id)
    }
}

/// Filter for [`LogStore::query`]; the time range is half-open `[from, to)`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(rename = "signal_type")]
    pub signal_kind: Option<SignalKind>,
    pub vehicle_id: Option<String>,
}

impl LogQuery {
    pub fn matches(&self, record: &LogRecord) -> bool {
        self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp < to)
            && self.signal_kind.map_or(true, |k| record.signal.kind == k)
            && self
                .vehicle_id
                .as_deref()
                .map_or(true, |id| record.involves(id))
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, record: &LogRecord) -> Result<(), StoreError>;

    /// Matching records in insertion order
    async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStoreKind {
    #[default]
    Jsonl,
    Sqlite,
    None,
}

fn default_log_path() -> PathBuf {
    PathBuf::from("logs/dispatch.jsonl")
}

fn default_sqlite_url() -> String {
    "sqlite://dispatch_logs.db".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStoreConfig {
    #[serde(default)]
    pub kind: LogStoreKind,
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default = "default_sqlite_url")]
    pub sqlite_url: String,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            kind: LogStoreKind::default(),
            path: default_log_path(),
            rotation: RotationConfig::default(),
            sqlite_url: default_sqlite_url(),
        }
    }
}

/// Build the configured store, `None` when logging is switched off
pub async fn open_log_store(cfg: &LogStoreConfig) -> Result<Option<Arc<dyn LogStore>>> {
    match cfg.kind {
        LogStoreKind::None => Ok(None),
        LogStoreKind::Jsonl => {
            let store = JsonlLogStore::open(&cfg.path, cfg.rotation.clone()).await?;
            Ok(Some(Arc::new(store)))
        }
        #[cfg(feature = "db")]
        LogStoreKind::Sqlite => {
            let store = SqlLogStore::connect(&cfg.sqlite_url).await?;
            Ok(Some(Arc::new(store)))
        }
        #[cfg(not(feature = "db"))]
        LogStoreKind::Sqlite => {
            anyhow::bail!("sqlite log store requires the 'db' feature")
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::FailureKind;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    pub(crate) fn record(kind: SignalKind, at: DateTime<Utc>, vehicles: &[&str]) -> LogRecord {
        let mut signal = FlexibilitySignal::new(kind, 20.0, Duration::from_secs(900));
        signal.timestamp = at;
        let mut result = DispatchResult::new(signal, 0.08);
        for v in vehicles {
            result.assignments.insert(v.to_string(), 20.0 / vehicles.len() as f64);
            result.acknowledged.insert(v.to_string(), true);
        }
        if let Some(first) = vehicles.first() {
            result.acknowledged.insert(first.to_string(), false);
            result.errors.insert(first.to_string(), FailureKind::AckTimeout);
        }
        LogRecord::from_result(&result, vehicles.iter().map(|v| v.to_string()).collect(), at)
    }

    #[test]
    fn test_record_json_keys() {
        let r = record(SignalKind::Fcr, Utc::now(), &["v1", "v2"]);
        let value = serde_json::to_value(&r).unwrap();
        for key in ["timestamp", "signal", "target_power", "vehicles_selected", "response"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        for key in [
            "assignments",
            "fallback_assignments",
            "errors",
            "acknowledged",
            "signal",
            "market_price",
            "scores",
        ] {
            assert!(value["response"].get(key).is_some(), "missing response.{key}");
        }
        assert_eq!(value["response"]["errors"]["v1"], "ack timeout");
    }

    #[test]
    fn test_query_matching() {
        let now = Utc::now();
        let mut r = record(SignalKind::Ma, now, &["v1"]);
        r.response.fallback_assignments.insert("v9".into(), 3.0);

        assert!(LogQuery::default().matches(&r));
        let window = LogQuery {
            from: Some(now),
            to: Some(now + ChronoDuration::seconds(1)),
            ..Default::default()
        };
        assert!(window.matches(&r));
        let ends_at_record = LogQuery {
            to: Some(now),
            ..Default::default()
        };
        assert!(!ends_at_record.matches(&r));

        let by_kind = LogQuery {
            signal_kind: Some(SignalKind::Fcr),
            ..Default::default()
        };
        assert!(!by_kind.matches(&r));

        for (id, hit) in [("v1", true), ("v9", true), ("v2", false)] {
            let q = LogQuery {
                vehicle_id: Some(id.into()),
                ..Default::default()
            };
            assert_eq!(q.matches(&r), hit, "{id}");
        }
    }
}
