//! Capacity-proportional allocation

use super::{prepare_candidates, Allocation, DispatchContext, Dispatcher, POWER_EPSILON};
use crate::domain::{Assignment, Vehicle};

/// Shares the target in proportion to each vehicle's capacity.
///
/// When the fleet cannot cover the target every vehicle gets its full
/// capacity and the rest stays undelivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualDispatcher;

impl EqualDispatcher {
    pub fn new() -> Self {
        Self
    }
}

impl Dispatcher for EqualDispatcher {
    fn name(&self) -> &'static str {
        "equal"
    }

    fn dispatch(&self, vehicles: &[Vehicle], ctx: &DispatchContext) -> Allocation {
        let signal = &ctx.signal;
        let target = signal.target_kw();
        if target <= POWER_EPSILON {
            return Allocation::empty();
        }

        let candidates = prepare_candidates(vehicles, signal, None, |_| 0.0);
        let total_capacity: f64 = candidates.iter().map(|c| c.capacity).sum();
        if total_capacity <= POWER_EPSILON {
            return Allocation::empty();
        }

        let direction = signal.direction();
        let ratio = (target / total_capacity).min(1.0);
        let assignments: Assignment = candidates
            .into_iter()
            .filter(|c| c.capacity > POWER_EPSILON)
            .map(|c| {
                let power = (c.capacity * ratio).min(c.capacity);
                (c.vehicle.id, power * direction)
            })
            .collect();

        Allocation {
            assignments,
            scores: None,
        }
    }
}
