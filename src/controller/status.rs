//! Last dispatch seen by each vehicle

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::SignalKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastDispatch {
    pub signal_kind: SignalKind,
    pub target_power_kw: f64,
    pub timestamp: DateTime<Utc>,
    /// Every vehicle selected in that dispatch
    pub selected: Vec<String>,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn record_last_dispatch(&self, vehicle_id: &str, summary: LastDispatch);

    async fn last_dispatch(&self, vehicle_id: &str) -> Option<LastDispatch>;
}

#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    entries: RwLock<HashMap<String, LastDispatch>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn record_last_dispatch(&self, vehicle_id: &str, summary: LastDispatch) {
        self.entries.write().insert(vehicle_id.to_string(), summary);
    }

    async fn last_dispatch(&self, vehicle_id: &str) -> Option<LastDispatch> {
        self.entries.read().get(vehicle_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_summary_wins() {
        let store = InMemoryStatusStore::new();
        assert!(store.last_dispatch("v1").await.is_none());

        let first = LastDispatch {
            signal_kind: SignalKind::Fcr,
            target_power_kw: 100.0,
            timestamp: Utc::now(),
            selected: vec!["v1".into(), "v2".into()],
        };
        store.record_last_dispatch("v1", first.clone()).await;
        let second = LastDispatch {
            signal_kind: SignalKind::Ma,
            ..first
        };
        store.record_last_dispatch("v1", second.clone()).await;
        assert_eq!(store.last_dispatch("v1").await, Some(second));
    }
}
