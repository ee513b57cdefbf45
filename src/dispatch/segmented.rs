//! Per-segment dispatch
//!
//! Vehicles are grouped by their segment tag and the target is split equally
//! over the non-empty groups. Each group is dispatched with its own weight
//! profile and strategy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    Allocation, DispatchContext, Dispatcher, LpDispatcher, SharedWeights, SmartConfig,
    SmartDispatcher, SmartWeights, POWER_EPSILON,
};
use crate::domain::{Scores, Vehicle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStrategy {
    #[default]
    Heuristic,
    Lp,
}

/// Dispatch settings of one segment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentProfile {
    pub weights: SmartWeights,
    pub strategy: SegmentStrategy,
    /// With the lp strategy, solve strictly and fall through to smart on failure
    pub fallback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentedConfig {
    /// Rounds and SoC constraints for every segment, weights for unknown ones
    #[serde(flatten)]
    pub base: SmartConfig,
    pub segments: BTreeMap<String, SegmentProfile>,
}

struct SegmentRunner {
    strategy: SegmentStrategy,
    fallback: bool,
    lp: LpDispatcher,
}

impl SegmentRunner {
    fn run(&self, segment: &str, vehicles: &[Vehicle], ctx: &DispatchContext) -> Allocation {
        match (self.strategy, self.fallback) {
            (SegmentStrategy::Heuristic, _) => self.lp.smart().dispatch(vehicles, ctx),
            (SegmentStrategy::Lp, true) => match self.lp.dispatch_strict(vehicles, ctx) {
                Ok(allocation) => allocation,
                Err(e) => {
                    tracing::info!(segment, error = %e, "segment lp failed, using smart");
                    self.lp.smart().dispatch(vehicles, ctx)
                }
            },
            (SegmentStrategy::Lp, false) => self.lp.dispatch(vehicles, ctx),
        }
    }
}

pub struct SegmentedDispatcher {
    segments: BTreeMap<String, SegmentRunner>,
    default: SmartDispatcher,
}

impl Default for SegmentedDispatcher {
    fn default() -> Self {
        Self::new(SegmentedConfig::default())
    }
}

impl SegmentedDispatcher {
    pub fn new(config: SegmentedConfig) -> Self {
        let segments = config
            .segments
            .into_iter()
            .map(|(name, profile)| {
                let smart = SmartDispatcher::new(SmartConfig {
                    weights: profile.weights,
                    ..config.base.clone()
                });
                let runner = SegmentRunner {
                    strategy: profile.strategy,
                    fallback: profile.fallback,
                    lp: LpDispatcher::from_smart(smart),
                };
                (name, runner)
            })
            .collect();

        Self {
            segments,
            default: SmartDispatcher::new(config.base),
        }
    }

    pub fn segment_names(&self) -> impl Iterator<Item = &str> {
        self.segments.keys().map(String::as_str)
    }
}

impl Dispatcher for SegmentedDispatcher {
    fn name(&self) -> &'static str {
        "segmented"
    }

    fn dispatch(&self, vehicles: &[Vehicle], ctx: &DispatchContext) -> Allocation {
        if ctx.signal.target_kw() <= POWER_EPSILON || vehicles.is_empty() {
            return Allocation::empty();
        }

        let mut groups: BTreeMap<&str, Vec<Vehicle>> = BTreeMap::new();
        for v in vehicles {
            groups.entry(v.segment.as_str()).or_default().push(v.clone());
        }

        let share = ctx.signal.with_power(ctx.signal.power_kw / groups.len() as f64);
        let sub_ctx = ctx.with_signal(share);

        let mut merged = Allocation::empty();
        let mut scores = Scores::new();
        for (segment, members) in &groups {
            let out = match self.segments.get(*segment) {
                Some(runner) => runner.run(segment, members, &sub_ctx),
                None => self.default.dispatch(members, &sub_ctx),
            };
            tracing::debug!(
                segment,
                vehicles = members.len(),
                delivered_kw = out.total_kw(),
                "segment dispatched"
            );
            merged.assignments.extend(out.assignments);
            scores.extend(out.scores.unwrap_or_default());
        }
        merged.scores = Some(scores);
        merged
    }

    fn tunable_weights(&self) -> Option<SharedWeights> {
        self.default.tunable_weights()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testutil::{signal, vehicle};
    use crate::domain::SignalKind;

    fn in_segment(id: &str, segment: &str, max_power: f64) -> Vehicle {
        Vehicle {
            segment: segment.into(),
            ..vehicle(id, max_power, 1.0)
        }
    }

    #[test]
    fn test_target_split_equally_between_segments() {
        let fleet = vec![
            in_segment("a1", "fleet", 50.0),
            in_segment("a2", "fleet", 50.0),
            in_segment("b1", "private", 50.0),
        ];
        let ctx = DispatchContext::for_signal(signal(SignalKind::Ma, 40.0));
        let out = SegmentedDispatcher::default().dispatch(&fleet, &ctx);
        let fleet_total = out.assignments["a1"] + out.assignments["a2"];
        assert!((fleet_total - 20.0).abs() < 1e-6);
        assert!((out.assignments["b1"] - 20.0).abs() < 1e-6);
        assert_eq!(out.scores.unwrap().len(), 3);
    }

    #[test]
    fn test_lp_segment_meets_its_share() {
        let config: SegmentedConfig = serde_json::from_value(serde_json::json!({
            "max_rounds": 5,
            "segments": {
                "fleet": { "strategy": "lp", "fallback": true },
            }
        }))
        .unwrap();
        assert_eq!(config.base.max_rounds, 5);
        let dispatcher = SegmentedDispatcher::new(config);
        assert_eq!(dispatcher.segment_names().collect::<Vec<_>>(), vec!["fleet"]);

        let fleet = vec![in_segment("a1", "fleet", 70.0), in_segment("a2", "fleet", 70.0)];
        let ctx = DispatchContext::for_signal(signal(SignalKind::Fcr, 60.0));
        let out = dispatcher.dispatch(&fleet, &ctx);
        assert!((out.total_kw() - 60.0).abs() < 1e-3);
    }

    #[test]
    fn test_lp_segment_with_fallback_survives_infeasible_share() {
        let config = SegmentedConfig {
            segments: BTreeMap::from([(
                "fleet".to_string(),
                SegmentProfile {
                    strategy: SegmentStrategy::Lp,
                    fallback: true,
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };
        let fleet = vec![in_segment("a1", "fleet", 10.0)];
        let ctx = DispatchContext::for_signal(signal(SignalKind::Fcr, 60.0));
        let out = SegmentedDispatcher::new(config).dispatch(&fleet, &ctx);
        // partial delivery from smart instead of nothing
        assert!((out.assignments["a1"] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_signal_split_keeps_sign() {
        let fleet = vec![in_segment("a", "x", 20.0), in_segment("b", "y", 20.0)];
        let ctx = DispatchContext::for_signal(signal(SignalKind::Afrr, -10.0));
        let out = SegmentedDispatcher::default().dispatch(&fleet, &ctx);
        assert!((out.assignments["a"] + 5.0).abs() < 1e-6);
        assert!((out.assignments["b"] + 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_fleet_is_empty() {
        let ctx = DispatchContext::for_signal(signal(SignalKind::Ma, 10.0));
        assert!(SegmentedDispatcher::default().dispatch(&[], &ctx).is_empty());
    }
}
