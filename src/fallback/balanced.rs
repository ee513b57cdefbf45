//! Headroom-weighted reallocation

use super::{redistribute, FallbackParams, FallbackStrategy};
use crate::dispatch::FillSlot;
use crate::domain::{Assignment, FlexibilitySignal, Vehicle, FALLBACK_MIN_SOC};

/// Spreads unserved power over acknowledged vehicles by remaining peak-power
/// headroom weighted with SoC. Vehicles under 30 % SoC are left alone.
#[derive(Debug, Clone, Default)]
pub struct BalancedFallback {
    params: FallbackParams,
}

impl BalancedFallback {
    pub fn new(params: FallbackParams) -> Self {
        Self { params }
    }
}

impl FallbackStrategy for BalancedFallback {
    fn name(&self) -> &'static str {
        "balanced"
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
                if v.soc < FALLBACK_MIN_SOC {
                    return None;
                }
                let headroom = v.max_power_kw - power.abs();
                (headroom > 0.0).then(|| FillSlot {
                    id: v.id.clone(),
                    weight: headroom * v.soc,
                    capacity: headroom,
                })
            },
        );

        tracing::info!(
            signal = %signal.kind,
            failed = failed.len(),
            residual_kw = result.residual,
            unserved_kw = result.unserved,
            efficiency = result.efficiency(),
            "balanced fallback reallocated"
        );
        result.assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::tests::{assignment, fleet_vehicle, signal};

    #[test]
    fn test_balanced_limited_by_peak_power() {
        let fleet = vec![fleet_vehicle("v1", 40.0, 0.7), fleet_vehicle("v2", 60.0, 0.7)];
        let current = assignment(&[("v1", 40.0), ("v2", 40.0)]);
        let out = BalancedFallback::default().reallocate(&fleet, &["v1".into()], &current, &signal(80.0));
        assert_eq!(out["v1"], 0.0);
        assert!((out["v2"] - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_balanced_weights_by_headroom_and_soc() {
        let fleet = vec![
            fleet_vehicle("v1", 30.0, 0.9),
            fleet_vehicle("v2", 50.0, 0.5),
            fleet_vehicle("v3", 50.0, 1.0),
        ];
        let current = assignment(&[("v1", 10.0), ("v2", 10.0), ("v3", 10.0)]);
        let out = BalancedFallback::default().reallocate(&fleet, &["v1".into()], &current, &signal(30.0));
        // headroom 40 each, weights 20 and 40 -> 10 kW split 1:2
        assert!((out["v2"] - (10.0 + 10.0 / 3.0)).abs() < 1e-9);
        assert!((out["v3"] - (10.0 + 20.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_balanced_skips_low_soc_and_keeps_sign() {
        let fleet = vec![
            fleet_vehicle("v1", 20.0, 0.9),
            fleet_vehicle("low", 20.0, 0.2),
            fleet_vehicle("ok", 20.0, 0.8),
        ];
        let current = assignment(&[("v1", -10.0), ("low", -5.0), ("ok", -5.0)]);
        let out = BalancedFallback::default().reallocate(&fleet, &["v1".into()], &current, &signal(-20.0));
        assert_eq!(out["low"], -5.0);
        assert!((out["ok"] + 15.0).abs() < 1e-9);
        assert_eq!(out["v1"], 0.0);
    }
}
