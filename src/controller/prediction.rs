//! Availability prediction from ack history

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::domain::{DispatchResult, Vehicle};

/// Estimates how likely a vehicle is to honour an order
pub trait AvailabilityPredictor: Send + Sync {
    /// Probability in [0, 1], `None` without history
    fn predict(&self, vehicle: &Vehicle) -> Option<f64>;

    /// Learn from a finished dispatch
    fn observe(&self, result: &DispatchResult);
}

/// Exponentially smoothed per-vehicle ack rate
#[derive(Debug)]
pub struct AckRatePredictor {
    alpha: f64,
    rates: RwLock<HashMap<String, f64>>,
}

impl Default for AckRatePredictor {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl AckRatePredictor {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            rates: RwLock::new(HashMap::new()),
        }
    }
}

impl AvailabilityPredictor for AckRatePredictor {
    fn predict(&self, vehicle: &Vehicle) -> Option<f64> {
        self.rates.read().get(&vehicle.id).copied()
    }

    fn observe(&self, result: &DispatchResult) {
        let mut rates = self.rates.write();
        for (id, acked) in &result.acknowledged {
            let sample = if *acked { 1.0 } else { 0.0 };
            let rate = rates
                .entry(id.clone())
                .and_modify(|r| *r = self.alpha * sample + (1.0 - self.alpha) * *r)
                .or_insert(sample);
            tracing::trace!(vehicle_id = %id, rate = *rate, "ack rate updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FlexibilitySignal, SignalKind};
    use std::time::Duration;

    fn result(acks: &[(&str, bool)]) -> DispatchResult {
        let signal = FlexibilitySignal::new(SignalKind::Ma, 10.0, Duration::ZERO);
        let mut r = DispatchResult::new(signal, 0.0);
        for (id, acked) in acks {
            r.acknowledged.insert(id.to_string(), *acked);
        }
        r
    }

    #[test]
    fn test_first_sample_seeds_rate() {
        let p = AckRatePredictor::default();
        let v = Vehicle {
            id: "v1".into(),
            ..Default::default()
        };
        assert_eq!(p.predict(&v), None);
        p.observe(&result(&[("v1", false)]));
        assert_eq!(p.predict(&v), Some(0.0));
    }

    #[test]
    fn test_rate_is_smoothed() {
        let p = AckRatePredictor::new(0.5);
        let v = Vehicle {
            id: "v1".into(),
            ..Default::default()
        };
        p.observe(&result(&[("v1", true)]));
        p.observe(&result(&[("v1", false)]));
        assert_eq!(p.predict(&v), Some(0.5));
        p.observe(&result(&[("v1", false)]));
        assert_eq!(p.predict(&v), Some(0.25));
    }
}
