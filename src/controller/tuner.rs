//! Online tuning of the availability weight
//!
//! A healthy ack rate pushes the weight up, timeouts push it down. The base
//! weight is adjusted, never the per-signal biased copy.

use serde::{Deserialize, Serialize};

use crate::dispatch::SharedWeights;
use crate::domain::DispatchResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub enabled: bool,
    pub increase: f64,
    pub decrease: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    /// Ack rate at or above which the weight grows
    pub threshold: f64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            increase: 0.05,
            decrease: 0.05,
            min_weight: 0.0,
            max_weight: 1.0,
            threshold: 0.9,
        }
    }
}

pub struct AckTuner {
    config: TunerConfig,
    weights: SharedWeights,
}

impl AckTuner {
    pub fn new(config: TunerConfig, weights: SharedWeights) -> Self {
        Self { config, weights }
    }

    pub fn availability_weight(&self) -> f64 {
        self.weights.lock().availability
    }

    /// Adjust from recent history and return the new weight.
    pub fn tune(&self, history: &[DispatchResult]) -> f64 {
        let total: usize = history.iter().map(|r| r.assignments.len()).sum();
        if total == 0 {
            return self.availability_weight();
        }
        let success: usize = history.iter().map(DispatchResult::acked_count).sum();
        let timeouts: usize = history.iter().map(DispatchResult::timeout_count).sum();
        let rate = success as f64 / total as f64;

        let delta = if rate >= self.config.threshold {
            self.config.increase
        } else if timeouts > 0 {
            -self.config.decrease
        } else {
            0.0
        };

        let mut weights = self.weights.lock();
        let before = weights.availability;
        weights.availability =
            (before + delta).clamp(self.config.min_weight, self.config.max_weight);
        if weights.availability != before {
            tracing::info!(
                ack_rate = rate,
                timeouts,
                before,
                after = weights.availability,
                "availability weight tuned"
            );
        }
        weights.availability
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::SmartWeights;
    use crate::domain::{FailureKind, FlexibilitySignal, SignalKind};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn shared(availability: f64) -> SharedWeights {
        Arc::new(Mutex::new(SmartWeights {
            availability,
            ..Default::default()
        }))
    }

    fn result(outcomes: &[(&str, bool, bool)]) -> DispatchResult {
        let signal = FlexibilitySignal::new(SignalKind::Fcr, 10.0, Duration::ZERO);
        let mut r = DispatchResult::new(signal, 0.0);
        for (id, acked, timed_out) in outcomes {
            r.assignments.insert(id.to_string(), 5.0);
            r.acknowledged.insert(id.to_string(), *acked);
            if *timed_out {
                r.errors.insert(id.to_string(), FailureKind::AckTimeout);
            }
        }
        r
    }

    #[test]
    fn test_decreases_on_timeouts() {
        let tuner = AckTuner::new(TunerConfig::default(), shared(0.5));
        let w = tuner.tune(&[result(&[("v1", false, true)])]);
        assert!(w < 0.5);
        assert!((w - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_increases_on_good_rate_and_clamps() {
        let tuner = AckTuner::new(TunerConfig::default(), shared(0.98));
        assert_eq!(tuner.tune(&[result(&[("v1", true, false)])]), 1.0);
    }

    #[test]
    fn test_no_change_without_timeouts_or_assignments() {
        let tuner = AckTuner::new(TunerConfig::default(), shared(0.5));
        // rejected, not timed out
        assert_eq!(tuner.tune(&[result(&[("v1", false, false)])]), 0.5);
        assert_eq!(tuner.tune(&[]), 0.5);
    }

    proptest! {
        #[test]
        fn prop_single_step_is_bounded(w0 in 0.0f64..=1.0, acked in 0usize..10, failed in 0usize..10) {
            prop_assume!(acked + failed > 0);
            let config = TunerConfig::default();
            let tuner = AckTuner::new(config.clone(), shared(w0));
            let mut outcomes = Vec::new();
            let ids: Vec<String> = (0..acked + failed).map(|i| format!("v{i}")).collect();
            for (i, id) in ids.iter().enumerate() {
                outcomes.push((id.as_str(), i < acked, i >= acked));
            }
            let rate = acked as f64 / (acked + failed) as f64;
            let w = tuner.tune(&[result(&outcomes)]);
            if rate >= config.threshold {
                prop_assert!(w >= w0 && w <= (w0 + config.increase).min(config.max_weight) + 1e-12);
            } else {
                prop_assert!(w <= w0 && w >= (w0 - config.decrease).max(config.min_weight) - 1e-12);
            }
        }
    }
}
