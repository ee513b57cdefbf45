use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::FlexibilitySignal;

/// Vehicle id to signed setpoint (kW)
pub type Assignment = BTreeMap<String, f64>;

/// Vehicle id to dispatcher score
pub type Scores = BTreeMap<String, f64>;

/// Why a vehicle did not end up acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport failure after all retries
    #[error("publish failed: {0}")]
    PublishFailed(String),
    /// No ack within the ack timeout
    #[error("ack timeout")]
    AckTimeout,
    /// Ack wait failed for another reason (unknown command, transport)
    #[error("ack failed: {0}")]
    AckFailed(String),
}

impl FailureKind {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FailureKind::AckTimeout)
    }
}

/// Outcome of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub signal: FlexibilitySignal,
    pub assignments: Assignment,
    /// Filled only when at least one vehicle failed to acknowledge
    pub fallback_assignments: Assignment,
    pub errors: BTreeMap<String, FailureKind>,
    pub acknowledged: BTreeMap<String, bool>,
    pub scores: Scores,
    pub market_price: f64,
}

impl DispatchResult {
    pub fn new(signal: FlexibilitySignal, market_price: f64) -> Self {
        Self {
            signal,
            assignments: Assignment::new(),
            fallback_assignments: Assignment::new(),
            errors: BTreeMap::new(),
            acknowledged: BTreeMap::new(),
            scores: Scores::new(),
            market_price,
        }
    }

    pub fn acked_count(&self) -> usize {
        self.acknowledged.values().filter(|a| **a).count()
    }

    pub fn timeout_count(&self) -> usize {
        self.errors.values().filter(|e| e.is_timeout()).count()
    }

    /// Sum of primary setpoint magnitudes
    pub fn assigned_kw(&self) -> f64 {
        self.assignments.values().map(|p| p.abs()).sum()
    }

    /// Power that acknowledged vehicles actually took on, after fallback
    pub fn delivered_kw(&self) -> f64 {
        let source = if self.fallback_assignments.is_empty() {
            &self.assignments
        } else {
            &self.fallback_assignments
        };
        source
            .iter()
            .filter(|(id, _)| self.acknowledged.get(*id).copied().unwrap_or(false))
            .map(|(_, p)| p.abs())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SignalKind;
    use std::time::Duration;

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::AckTimeout.to_string(), "ack timeout");
        assert_eq!(
            FailureKind::PublishFailed("broker down".into()).to_string(),
            "publish failed: broker down"
        );
        assert!(FailureKind::AckTimeout.is_timeout());
        assert!(!FailureKind::AckFailed("x".into()).is_timeout());
    }

    #[test]
    fn test_delivered_prefers_fallback() {
        let signal = FlexibilitySignal::new(SignalKind::Fcr, 80.0, Duration::ZERO);
        let mut result = DispatchResult::new(signal, 0.0);
        result.assignments.insert("v1".into(), 40.0);
        result.assignments.insert("v2".into(), 40.0);
        result.acknowledged.insert("v1".into(), false);
        result.acknowledged.insert("v2".into(), true);
        assert_eq!(result.delivered_kw(), 40.0);

        result.fallback_assignments.insert("v1".into(), 0.0);
        result.fallback_assignments.insert("v2".into(), 60.0);
        assert_eq!(result.delivered_kw(), 60.0);
        assert_eq!(result.acked_count(), 1);
        assert_eq!(result.assigned_kw(), 80.0);
    }
}
