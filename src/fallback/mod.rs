//! Reallocation of unserved power
//!
//! After publishing, vehicles that did not acknowledge leave part of the
//! target unserved. A fallback strategy zeroes their setpoints and moves the
//! residual onto vehicles that did answer.

pub mod balanced;
pub mod probabilistic;

pub use balanced::*;
pub use probabilistic::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dispatch::{decode_params, water_fill, FillSlot, RegistryError, StrategySpec, POWER_EPSILON};
use crate::domain::{Assignment, FlexibilitySignal, Vehicle};

pub trait FallbackStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// New setpoints given the vehicles that failed.
    ///
    /// `fleet` is the filtered set the dispatch ran on; it supplies headroom
    /// and SoC. Failed vehicles always end up at zero in the returned map.
    fn reallocate(
        &self,
        fleet: &[Vehicle],
        failed: &[String],
        current: &Assignment,
        signal: &FlexibilitySignal,
    ) -> Assignment;
}

/// Leaves the assignments as they are
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFallback;

impl FallbackStrategy for NoopFallback {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn reallocate(
        &self,
        _fleet: &[Vehicle],
        _failed: &[String],
        current: &Assignment,
        _signal: &FlexibilitySignal,
    ) -> Assignment {
        current.clone()
    }
}

/// Water-filling parameters shared by the reallocating strategies
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackParams {
    /// 0 = until the residual is placed or headroom runs out
    pub max_rounds: usize,
}

/// Result of moving the residual around
pub(crate) struct Redistribution {
    pub assignments: Assignment,
    pub residual: f64,
    pub unserved: f64,
}

impl Redistribution {
    pub fn efficiency(&self) -> f64 {
        if self.residual <= POWER_EPSILON {
            1.0
        } else {
            (self.residual - self.unserved) / self.residual
        }
    }
}

/// Zero the failed vehicles and water-fill their power onto the slots that
/// `slot_for` builds from the surviving assigned vehicles.
pub(crate) fn redistribute<F>(
    fleet: &[Vehicle],
    failed: &[String],
    current: &Assignment,
    signal: &FlexibilitySignal,
    max_rounds: usize,
    slot_for: F,
) -> Redistribution
where
    F: Fn(&Vehicle, f64) -> Option<FillSlot>,
{
    let mut assignments = current.clone();
    let mut residual = 0.0;
    for id in failed {
        if let Some(power) = assignments.get_mut(id) {
            residual += power.abs();
            *power = 0.0;
        }
    }

    let slots: Vec<FillSlot> = fleet
        .iter()
        .filter(|v| !failed.contains(&v.id))
        .filter_map(|v| {
            let power = *current.get(&v.id)?;
            if power.abs() <= POWER_EPSILON {
                return None;
            }
            slot_for(v, power)
        })
        .collect();

    let outcome = water_fill(slots, residual, max_rounds);
    let direction = signal.direction();
    for (id, extra) in outcome.allocated {
        if let Some(power) = assignments.get_mut(&id) {
            *power += extra * direction;
        }
    }

    Redistribution {
        assignments,
        residual,
        unserved: outcome.remaining,
    }
}

pub type FallbackFactory = Box<
    dyn Fn(serde_json::Value) -> Result<Arc<dyn FallbackStrategy>, RegistryError> + Send + Sync,
>;

pub struct FallbackRegistry {
    factories: BTreeMap<String, FallbackFactory>,
}

impl Default for FallbackRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("noop", |_| Ok(Arc::new(NoopFallback)));
        registry.register("balanced", |p| {
            Ok(Arc::new(BalancedFallback::new(decode_params("balanced", p)?)))
        });
        registry.register("probabilistic", |p| {
            Ok(Arc::new(ProbabilisticFallback::new(decode_params(
                "probabilistic",
                p,
            )?)))
        });
        registry
    }
}

impl FallbackRegistry {
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(serde_json::Value) -> Result<Arc<dyn FallbackStrategy>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, spec: &StrategySpec) -> Result<Arc<dyn FallbackStrategy>, RegistryError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| RegistryError::Unknown(spec.kind.clone()))?;
        factory(spec.params.clone())
    }
}
