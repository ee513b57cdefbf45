//! Weighted-score greedy dispatcher
//!
//! Each eligible vehicle gets a score built from its spare energy, how soon
//! it leaves, its priority flag, the current market price, its availability
//! probability and a participation (wear + fairness) penalty. The target is
//! then poured over the fleet in score proportion, round after round, until
//! it is placed or every vehicle is full.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{
    prepare_candidates, signed, water_fill, Allocation, Candidate, DispatchContext, Dispatcher,
    FillSlot, POWER_EPSILON,
};
use crate::domain::{Assignment, FlexibilitySignal, Scores, SignalKind, Vehicle};

/// Score weights of the smart dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartWeights {
    pub soc: f64,
    pub time: f64,
    pub priority: f64,
    pub price: f64,
    pub wear: f64,
    pub fairness: f64,
    pub availability: f64,
}

impl Default for SmartWeights {
    fn default() -> Self {
        Self {
            soc: 0.5,
            time: 0.3,
            priority: 0.1,
            price: 0.05,
            wear: 0.05,
            fairness: 0.05,
            availability: 0.1,
        }
    }
}

impl SmartWeights {
    /// Copy of the weights nudged for a signal kind. Base weights stay
    /// untouched so tuner adjustments remain readable.
    pub fn biased_for(&self, kind: SignalKind) -> Self {
        let mut w = *self;
        match kind {
            SignalKind::Fcr => {
                w.soc += 0.2;
                w.priority += 0.1;
            }
            SignalKind::Nebef => {
                w.soc += 0.1;
                w.time += 0.2;
            }
            SignalKind::Ma | SignalKind::EcoWatt => {
                w.soc += 0.1;
            }
            SignalKind::Afrr => {}
        }
        w
    }
}

/// Weights shared between a dispatcher and whoever tunes it
pub type SharedWeights = Arc<Mutex<SmartWeights>>;

fn default_max_rounds() -> usize {
    10
}

fn default_safe_floor() -> f64 {
    0.2
}

/// Construction parameters of [`SmartDispatcher`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartConfig {
    #[serde(default)]
    pub weights: SmartWeights,
    /// Refinement rounds, 0 = unlimited
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Enforce `safe_discharge_floor` on top of each vehicle's own MinSoC
    #[serde(default)]
    pub soc_constraints: bool,
    #[serde(default = "default_safe_floor")]
    pub safe_discharge_floor: f64,
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            weights: SmartWeights::default(),
            max_rounds: default_max_rounds(),
            soc_constraints: false,
            safe_discharge_floor: default_safe_floor(),
        }
    }
}

pub struct SmartDispatcher {
    weights: SharedWeights,
    max_rounds: usize,
    safe_floor: Option<f64>,
}

impl Default for SmartDispatcher {
    fn default() -> Self {
        Self::new(SmartConfig::default())
    }
}

impl SmartDispatcher {
    pub fn new(config: SmartConfig) -> Self {
        let weights = Arc::new(Mutex::new(config.weights));
        Self::with_shared_weights(config, weights)
    }

    /// Build on top of weights owned elsewhere (another dispatcher, a tuner).
    /// `config.weights` is ignored.
    pub fn with_shared_weights(config: SmartConfig, weights: SharedWeights) -> Self {
        Self {
            weights,
            max_rounds: config.max_rounds,
            safe_floor: config.soc_constraints.then_some(config.safe_discharge_floor),
        }
    }

    pub fn weights(&self) -> SmartWeights {
        *self.weights.lock()
    }

    pub fn set_weights(&self, weights: SmartWeights) {
        *self.weights.lock() = weights;
    }

    pub fn shared_weights(&self) -> SharedWeights {
        self.weights.clone()
    }

    pub fn availability_weight(&self) -> f64 {
        self.weights.lock().availability
    }

    pub fn set_availability_weight(&self, value: f64) {
        self.weights.lock().availability = value;
    }

    pub fn safe_floor(&self) -> Option<f64> {
        self.safe_floor
    }

    /// Score of one vehicle under explicit weights, never negative.
    pub fn score(&self, vehicle: &Vehicle, ctx: &DispatchContext, w: &SmartWeights) -> f64 {
        let energy_norm = if vehicle.min_soc >= 1.0 {
            0.0
        } else {
            ((vehicle.soc - vehicle.min_soc) / (1.0 - vehicle.min_soc)).clamp(0.0, 1.0)
        };
        let time_score = vehicle
            .minutes_until_departure(ctx.now)
            .map_or(0.0, |m| (-m / 30.0).exp());
        let priority = if vehicle.priority { 1.0 } else { 0.0 };
        let participation = ctx.participation(&vehicle.id);

        let score = energy_norm * w.soc
            + time_score * w.time
            + priority * w.priority
            + energy_norm * ctx.market_price * w.price
            + vehicle.availability_prob * w.availability
            - participation * (w.wear + w.fairness);
        score.max(0.0)
    }

    /// Candidates scored with the signal-kind biased copy of the weights
    pub fn candidates(&self, vehicles: &[Vehicle], ctx: &DispatchContext) -> Vec<Candidate> {
        let w = self.weights().biased_for(ctx.signal.kind);
        prepare_candidates(vehicles, &ctx.signal, self.safe_floor, |v| {
            self.score(v, ctx, &w)
        })
    }

    /// Greedy water-filling over already scored candidates
    pub fn allocate(&self, candidates: &[Candidate], signal: &FlexibilitySignal) -> Assignment {
        let slots = candidates
            .iter()
            .map(|c| FillSlot {
                id: c.vehicle.id.clone(),
                weight: c.score,
                capacity: c.capacity,
            })
            .collect();
        let outcome = water_fill(slots, signal.target_kw(), self.max_rounds);
        if outcome.remaining > POWER_EPSILON {
            tracing::debug!(
                signal = %signal.kind,
                unplaced_kw = outcome.remaining,
                rounds = outcome.rounds,
                "smart dispatch left power unplaced"
            );
        }
        signed(outcome.allocated, signal)
    }
}

pub(crate) fn scores_of(candidates: &[Candidate]) -> Scores {
    candidates
        .iter()
        .map(|c| (c.vehicle.id.clone(), c.score))
        .collect()
}

impl Dispatcher for SmartDispatcher {
    fn name(&self) -> &'static str {
        "smart"
    }

    fn dispatch(&self, vehicles: &[Vehicle], ctx: &DispatchContext) -> Allocation {
        if ctx.signal.target_kw() <= POWER_EPSILON {
            return Allocation::empty();
        }
        let candidates = self.candidates(vehicles, ctx);
        Allocation {
            assignments: self.allocate(&candidates, &ctx.signal),
            scores: Some(scores_of(&candidates)),
        }
    }

    fn tunable_weights(&self) -> Option<SharedWeights> {
        Some(self.shared_weights())
    }
}
