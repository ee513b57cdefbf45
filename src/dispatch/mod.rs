//! Dispatch strategies
//!
//! Turn one flexibility signal and a set of eligible vehicles into
//! per-vehicle setpoints:
//! - Equal: proportional to capacity
//! - Smart: weighted-score greedy water-filling
//! - LP: simplex optimum of the scoring objective
//! - Segmented: per-segment weight profile and strategy

pub mod context;
pub mod equal;
pub mod filter;
pub mod lp;
pub mod registry;
pub mod segmented;
pub mod smart;

pub use context::*;
pub use equal::*;
pub use filter::*;
pub use lp::*;
pub use registry::*;
pub use segmented::*;
pub use smart::*;

use std::collections::BTreeMap;

use crate::domain::{Assignment, FlexibilitySignal, Scores, Vehicle};

/// Anything below this is treated as zero power
pub const POWER_EPSILON: f64 = 1e-9;

/// Setpoints produced by a dispatcher, plus the scores it ranked by (if any)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocation {
    pub assignments: Assignment,
    pub scores: Option<Scores>,
}

impl Allocation {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn total_kw(&self) -> f64 {
        self.assignments.values().map(|p| p.abs()).sum()
    }
}

/// Common interface of all allocation strategies
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn dispatch(&self, vehicles: &[Vehicle], ctx: &DispatchContext) -> Allocation;

    /// Weights the ack tuner may adjust, when the strategy is score based
    fn tunable_weights(&self) -> Option<SharedWeights> {
        None
    }
}

/// A vehicle that survived preparation, with its score and usable capacity (kW)
#[derive(Debug, Clone)]
pub struct Candidate {
    pub vehicle: Vehicle,
    pub score: f64,
    pub capacity: f64,
}

/// Usable power of `vehicle` for `signal`, or `None` if it cannot contribute.
///
/// Injection requests are bounded by peak power only. Reduction requests are
/// also bounded by the energy above `floor` spread over the signal duration.
pub fn vehicle_capacity(
    vehicle: &Vehicle,
    signal: &FlexibilitySignal,
    safe_floor: Option<f64>,
) -> Option<f64> {
    if signal.power_kw >= 0.0 {
        return Some(vehicle.max_power_kw.max(0.0));
    }

    let floor = safe_floor.map_or(vehicle.min_soc, |f| vehicle.min_soc.max(f));
    let slack = vehicle.energy_slack_kwh(floor);
    if slack <= 0.0 {
        return None;
    }
    let mut capacity = vehicle.max_power_kw;
    let hours = signal.duration_hours();
    if hours > 0.0 {
        capacity = capacity.min(slack / hours);
    }
    (capacity > 0.0).then_some(capacity)
}

/// Build candidates for every vehicle that has usable capacity.
pub fn prepare_candidates<F>(
    vehicles: &[Vehicle],
    signal: &FlexibilitySignal,
    safe_floor: Option<f64>,
    score: F,
) -> Vec<Candidate>
where
    F: Fn(&Vehicle) -> f64,
{
    vehicles
        .iter()
        .filter_map(|v| {
            let capacity = vehicle_capacity(v, signal, safe_floor)?;
            Some(Candidate {
                vehicle: v.clone(),
                score: score(v),
                capacity,
            })
        })
        .collect()
}

/// One entry of a water-filling run
#[derive(Debug, Clone)]
pub struct FillSlot {
    pub id: String,
    pub weight: f64,
    pub capacity: f64,
}

/// Outcome of [`water_fill`]
#[derive(Debug, Clone, Default)]
pub struct FillOutcome {
    /// Unsigned power handed to each slot (only slots that received some)
    pub allocated: BTreeMap<String, f64>,
    /// Power that could not be placed
    pub remaining: f64,
    pub rounds: usize,
}

/// Weighted multi-round water-filling.
///
/// Each round offers every live slot `remaining * weight / weight_sum`. A slot
/// whose offer meets its residual capacity is filled and leaves, freeing its
/// weight for the next round. Stops when nothing remains, no slot is left,
/// the weights sum to zero, a round places nothing, or `max_rounds` is hit
/// (0 means unlimited).
pub fn water_fill(slots: Vec<FillSlot>, total: f64, max_rounds: usize) -> FillOutcome {
    let mut outcome = FillOutcome {
        remaining: total.max(0.0),
        ..Default::default()
    };
    let mut live: Vec<FillSlot> = slots
        .into_iter()
        .filter(|s| s.capacity > POWER_EPSILON && s.weight >= 0.0)
        .collect();
    let mut weight_sum: f64 = live.iter().map(|s| s.weight).sum();

    while outcome.remaining > POWER_EPSILON && !live.is_empty() && weight_sum > 0.0 {
        if max_rounds != 0 && outcome.rounds >= max_rounds {
            break;
        }
        outcome.rounds += 1;

        let budget = outcome.remaining;
        let round_weight = weight_sum;
        let mut consumed = 0.0;

        live.retain_mut(|slot| {
            let share = budget * slot.weight / round_weight;
            if share <= 0.0 {
                return true;
            }
            let given = if share >= slot.capacity {
                slot.capacity
            } else {
                share
            };
            *outcome.allocated.entry(slot.id.clone()).or_insert(0.0) += given;
            consumed += given;
            slot.capacity -= given;
            if slot.capacity <= POWER_EPSILON {
                weight_sum -= slot.weight;
                false
            } else {
                true
            }
        });

        outcome.remaining = (outcome.remaining - consumed).max(0.0);
        if consumed <= POWER_EPSILON {
            break;
        }
    }

    outcome
}

/// Apply the signal direction to unsigned allocations, dropping zeros.
pub fn signed(allocated: BTreeMap<String, f64>, signal: &FlexibilitySignal) -> Assignment {
    let direction = signal.direction();
    allocated
        .into_iter()
        .filter(|(_, p)| *p > POWER_EPSILON)
        .map(|(id, p)| (id, p * direction))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::domain::SignalKind;
    use std::time::Duration;

    fn slot(id: &str, weight: f64, capacity: f64) -> FillSlot {
        FillSlot {
            id: id.into(),
            weight,
            capacity,
        }
    }

    #[test]
    fn test_injection_capacity_is_peak_power() {
        let v = vehicle("v1", 22.0, 0.1);
        let s = signal(SignalKind::Ma, 10.0);
        assert_eq!(vehicle_capacity(&v, &s, Some(0.9)), Some(22.0));
    }

    #[test]
    fn test_reduction_capacity_is_energy_bounded() {
        // 0.2 * 50 kWh = 10 kWh over 2h -> 5 kW
        let v = vehicle("v1", 22.0, 0.5);
        let s = FlexibilitySignal::new(SignalKind::Afrr, -10.0, Duration::from_secs(7200));
        let cap = vehicle_capacity(&v, &s, Some(0.3)).unwrap();
        assert!((cap - 5.0).abs() < 1e-9);

        // below the floor -> dropped
        assert!(vehicle_capacity(&v, &s, Some(0.6)).is_none());

        // zero duration only bounded by peak power
        let instant = FlexibilitySignal::new(SignalKind::Afrr, -10.0, Duration::ZERO);
        assert_eq!(vehicle_capacity(&v, &instant, Some(0.3)), Some(22.0));
    }

    #[test]
    fn test_vehicle_min_soc_wins_over_lower_floor() {
        let v = Vehicle {
            min_soc: 0.4,
            ..vehicle("v1", 22.0, 0.5)
        };
        let s = FlexibilitySignal::new(SignalKind::Afrr, -10.0, Duration::from_secs(3600));
        // (0.5 - 0.4) * 50 = 5 kWh over 1h
        let cap = vehicle_capacity(&v, &s, Some(0.2)).unwrap();
        assert!((cap - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_water_fill_redistributes_capped_share() {
        let out = water_fill(
            vec![slot("a", 1.0, 10.0), slot("b", 1.0, 100.0)],
            60.0,
            10,
        );
        assert!((out.allocated["a"] - 10.0).abs() < 1e-9);
        assert!((out.allocated["b"] - 50.0).abs() < 1e-9);
        assert!(out.remaining < 1e-9);
        assert_eq!(out.rounds, 1);
    }

    #[test]
    fn test_water_fill_reports_unplaced_power() {
        let out = water_fill(vec![slot("a", 2.0, 10.0), slot("b", 1.0, 5.0)], 30.0, 0);
        assert!((out.allocated["a"] - 10.0).abs() < 1e-9);
        assert!((out.allocated["b"] - 5.0).abs() < 1e-9);
        assert!((out.remaining - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_water_fill_zero_weights_place_nothing() {
        let out = water_fill(vec![slot("a", 0.0, 10.0)], 5.0, 10);
        assert!(out.allocated.is_empty());
        assert_eq!(out.remaining, 5.0);
    }

    #[test]
    fn test_water_fill_round_limit() {
        // Shares are capped every round, so one round is not enough
        let out = water_fill(
            vec![slot("a", 1.0, 1.0), slot("b", 1.0, 100.0)],
            100.0,
            1,
        );
        assert_eq!(out.rounds, 1);
        assert!((out.allocated["b"] - 50.0).abs() < 1e-9);
        assert!((out.remaining - 49.0).abs() < 1e-9);
    }

    #[test]
    fn test_signed_applies_direction() {
        let mut raw = BTreeMap::new();
        raw.insert("a".to_string(), 3.0);
        raw.insert("b".to_string(), 0.0);
        let s = signal(SignalKind::Afrr, -3.0);
        let out = signed(raw, &s);
        assert_eq!(out.len(), 1);
        assert_eq!(out["a"], -3.0);
    }
}
