//! SQLite-backed dispatch log

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;

use super::{LogQuery, LogRecord, LogStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dispatch_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ts          INTEGER NOT NULL,
    signal_type TEXT    NOT NULL,
    record      TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS dispatch_logs_ts ON dispatch_logs (ts);
"#;

/// Records are stored verbatim as JSON next to an epoch-millisecond key
pub struct SqlLogStore {
    pool: SqlitePool,
}

impl SqlLogStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // an in-memory database lives only as long as its single connection
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        tracing::info!(url, "sqlite log store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl LogStore for SqlLogStore {
    async fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
        if self.pool.is_closed() {
            return Err(StoreError::Closed);
        }
        let body = serde_json::to_string(record)?;
        sqlx::query("INSERT INTO dispatch_logs (ts, signal_type, record) VALUES (?, ?, ?)")
            .bind(record.timestamp.timestamp_millis())
            .bind(record.signal.kind.as_ref())
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>, StoreError> {
        let mut sql: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT record FROM dispatch_logs WHERE 1 = 1");
        // millisecond bounds are widened here and tightened by `matches`
        if let Some(from) = query.from {
            sql.push(" AND ts >= ").push_bind(from.timestamp_millis());
        }
        if let Some(to) = query.to {
            sql.push(" AND ts <= ").push_bind(to.timestamp_millis());
        }
        if let Some(kind) = query.signal_kind {
            sql.push(" AND signal_type = ").push_bind(kind.as_ref().to_string());
        }
        sql.push(" ORDER BY ts ASC, id ASC");

        let rows = sql.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("record")?;
            match serde_json::from_str::<LogRecord>(&body) {
                Ok(record) if query.matches(&record) => out.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "skipping undecodable log row"),
            }
        }
        Ok(out)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
