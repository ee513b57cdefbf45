//! Reallocation by expected deliverable capacity

use super::{redistribute, FallbackParams, FallbackStrategy};
use crate::dispatch::{FillSlot, POWER_EPSILON};
use crate::domain::{Assignment, FlexibilitySignal, Vehicle};

/// Weights survivors by [`Vehicle::effective_capacity`], which discounts
/// headroom by degradation, SoC and availability probability.
#[derive(Debug, Clone, Default)]
pub struct ProbabilisticFallback {
    params: FallbackParams,
}

impl ProbabilisticFallback {
    pub fn new(params: FallbackParams) -> Self {
        Self { params }
    }
}

impl FallbackStrategy for ProbabilisticFallback {
    fn name(&self) -> &'static str {
        "probabilistic"
    }

    fn reallocate(
        &self,
        fleet: &[Vehicle],
        failed: &[String],
        current: &Assignment,
        signal: &FlexibilitySignal,
    ) -> Assignment {
        let result = redistribute(
            fleet,
            failed,
            current,
            signal,
            self.params.max_rounds,
            |v, power| {
                let capacity = v.effective_capacity(power);
                (capacity > 0.0).then(|| FillSlot {
                    id: v.id.clone(),
                    weight: capacity,
                    capacity,
                })
            },
        );

        if result.unserved > POWER_EPSILON {
            tracing::error!(
                signal = %signal.kind,
                residual_kw = result.residual,
                unserved_kw = result.unserved,
                "probabilistic fallback could not place all power"
            );
        } else {
            tracing::info!(
                signal = %signal.kind,
                residual_kw = result.residual,
                "probabilistic fallback reallocated"
            );
        }
        result.assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::tests::{assignment, fleet_vehicle, signal};

    #[test]
    fn test_low_soc_survivor_gets_nothing() {
        let fleet = vec![fleet_vehicle("v1", 50.0, 1.0), fleet_vehicle("v2", 50.0, 0.25)];
        let current = assignment(&[("v1", 30.0), ("v2", 30.0)]);
        let out = ProbabilisticFallback::default().reallocate(
            &fleet,
            &["v1".into()],
            &current,
            &signal(60.0),
        );
        assert_eq!(out["v1"], 0.0);
        assert_eq!(out["v2"], 30.0);
    }

    #[test]
    fn test_capacity_discounted_by_availability() {
        let mut unsure = fleet_vehicle("unsure", 50.0, 1.0);
        unsure.availability_prob = 0.5;
        let fleet = vec![fleet_vehicle("v1", 50.0, 1.0), unsure, fleet_vehicle("sure", 50.0, 1.0)];
        let current = assignment(&[("v1", 10.0), ("unsure", 10.0), ("sure", 10.0)]);
        let out = ProbabilisticFallback::default().reallocate(
            &fleet,
            &["v1".into()],
            &current,
            &signal(30.0),
        );
        // capacities 20 and 40 -> 10 kW split 1:2
        assert!((out["unsure"] - (10.0 + 10.0 / 3.0)).abs() < 1e-9);
        assert!((out["sure"] - (10.0 + 20.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_degradation_caps_reallocation() {
        let mut worn = fleet_vehicle("worn", 50.0, 1.0);
        worn.degradation = 0.5;
        let fleet = vec![fleet_vehicle("v1", 50.0, 1.0), worn];
        let current = assignment(&[("v1", 40.0), ("worn", 20.0)]);
        let out = ProbabilisticFallback::default().reallocate(
            &fleet,
            &["v1".into()],
            &current,
            &signal(60.0),
        );
        // 25 kW derated peak leaves 5 kW
        assert!((out["worn"] - 25.0).abs() < 1e-9);
    }
}
