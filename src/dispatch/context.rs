//! Per-dispatch scoring inputs

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::FlexibilitySignal;

/// Rolling per-vehicle participation counters.
///
/// Read concurrently while scoring, written between dispatches. Lives for
/// the whole manager lifetime and is only reset by an operator.
#[derive(Debug, Default)]
pub struct Participation {
    scores: RwLock<HashMap<String, f64>>,
}

impl Participation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, vehicle_id: &str) -> f64 {
        self.scores.read().get(vehicle_id).copied().unwrap_or(0.0)
    }

    /// Add `amount` (clamped to be non-negative) to a vehicle's counter
    pub fn increment(&self, vehicle_id: &str, amount: f64) {
        let mut scores = self.scores.write();
        *scores.entry(vehicle_id.to_string()).or_insert(0.0) += amount.max(0.0);
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.scores.read().clone()
    }

    pub fn clear(&self) {
        self.scores.write().clear();
    }
}

/// Immutable view handed to a dispatcher for one dispatch
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub signal: FlexibilitySignal,
    /// Reference time for departure-based scoring (the signal timestamp)
    pub now: DateTime<Utc>,
    pub market_price: f64,
    participation: Arc<Participation>,
}

impl DispatchContext {
    pub fn new(
        signal: FlexibilitySignal,
        market_price: f64,
        participation: Arc<Participation>,
    ) -> Self {
        Self {
            now: signal.timestamp,
            signal,
            market_price,
            participation,
        }
    }

    /// Context without price or participation history, handy for tests and
    /// one-off dispatches.
    pub fn for_signal(signal: FlexibilitySignal) -> Self {
        Self::new(signal, 0.0, Arc::new(Participation::new()))
    }

    pub fn participation(&self, vehicle_id: &str) -> f64 {
        self.participation.get(vehicle_id)
    }

    /// Same context with another signal (segment sub-targets)
    pub fn with_signal(&self, signal: FlexibilitySignal) -> Self {
        Self {
            signal,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participation_increment_and_clear() {
        let p = Participation::new();
        assert_eq!(p.get("v1"), 0.0);
        p.increment("v1", 1.0);
        p.increment("v1", 0.5);
        p.increment("v1", -3.0);
        assert_eq!(p.get("v1"), 1.5);
        assert_eq!(p.snapshot().len(), 1);
        p.clear();
        assert_eq!(p.get("v1"), 0.0);
    }

    #[test]
    fn test_context_reads_shared_participation() {
        let shared = Arc::new(Participation::new());
        shared.increment("ev-7", 2.0);
        let signal = FlexibilitySignal::new(
            crate::domain::SignalKind::Ma,
            10.0,
            std::time::Duration::ZERO,
        );
        let ctx = DispatchContext::new(signal.clone(), 0.12, shared);
        assert_eq!(ctx.participation("ev-7"), 2.0);
        assert_eq!(ctx.now, signal.timestamp);
    }
}
