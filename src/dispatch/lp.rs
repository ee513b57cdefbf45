//! Linear-programming dispatcher
//!
//! maximize   Σ score_i · x_i
//! subject to 0 ≤ x_i ≤ cap_i
//!            Σ x_i = |target|
//!
//! Scores come from the embedded [`SmartDispatcher`], so both strategies rank
//! vehicles identically and the smart allocation is the natural fallback when
//! the program has no solution.

use minilp::{ComparisonOp, LinearExpr, OptimizationDirection, Problem};
use thiserror::Error;

use super::smart::scores_of;
use super::{
    signed, Allocation, DispatchContext, Dispatcher, SharedWeights, SmartConfig, SmartDispatcher,
    POWER_EPSILON,
};
use crate::domain::Vehicle;

/// Slack tolerated on the capacity bounds
pub const BOUND_TOLERANCE: f64 = 1e-7;
/// Slack tolerated on the total power equality
pub const EQUALITY_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LpError {
    #[error("solver error: {0}")]
    Solver(String),
    #[error("infeasible: delivered {delivered:.3} kW of {target:.3} kW")]
    Infeasible { delivered: f64, target: f64 },
}

/// Solves the bounded single-equality program above.
///
/// Returns one value per objective coefficient.
pub trait LpSolver: Send + Sync {
    fn solve(&self, objective: &[f64], upper: &[f64], total: f64) -> Result<Vec<f64>, LpError>;
}

/// Dense simplex from `minilp`
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplexSolver;

impl LpSolver for SimplexSolver {
    fn solve(&self, objective: &[f64], upper: &[f64], total: f64) -> Result<Vec<f64>, LpError> {
        if objective.len() != upper.len() {
            return Err(LpError::Solver(format!(
                "{} objective coefficients for {} bounds",
                objective.len(),
                upper.len()
            )));
        }

        let mut problem = Problem::new(OptimizationDirection::Maximize);
        let vars: Vec<_> = objective
            .iter()
            .zip(upper)
            .map(|(score, cap)| problem.add_var(*score, (0.0, cap.max(0.0))))
            .collect();

        let mut sum = LinearExpr::empty();
        for var in &vars {
            sum.add(*var, 1.0);
        }
        problem.add_constraint(sum, ComparisonOp::Eq, total);

        match problem.solve() {
            Ok(solution) => Ok(vars.iter().map(|v| solution[*v]).collect()),
            Err(minilp::Error::Infeasible) => Err(LpError::Infeasible {
                delivered: upper.iter().map(|c| c.max(0.0)).sum(),
                target: total,
            }),
            Err(e) => Err(LpError::Solver(e.to_string())),
        }
    }
}

pub struct LpDispatcher {
    smart: SmartDispatcher,
    solver: Box<dyn LpSolver>,
}

impl Default for LpDispatcher {
    fn default() -> Self {
        Self::new(SmartConfig::default())
    }
}

impl LpDispatcher {
    pub fn new(config: SmartConfig) -> Self {
        Self::from_smart(SmartDispatcher::new(config))
    }

    pub fn from_smart(smart: SmartDispatcher) -> Self {
        Self {
            smart,
            solver: Box::new(SimplexSolver),
        }
    }

    pub fn with_solver(mut self, solver: impl LpSolver + 'static) -> Self {
        self.solver = Box::new(solver);
        self
    }

    /// The scoring dispatcher used for the objective and for non-strict fallback
    pub fn smart(&self) -> &SmartDispatcher {
        &self.smart
    }

    /// Exact allocation or the reason there is none.
    pub fn dispatch_strict(
        &self,
        vehicles: &[Vehicle],
        ctx: &DispatchContext,
    ) -> Result<Allocation, LpError> {
        let target = ctx.signal.target_kw();
        if target <= POWER_EPSILON {
            return Ok(Allocation::empty());
        }

        let candidates = self.smart.candidates(vehicles, ctx);
        if candidates.is_empty() {
            return Err(LpError::Infeasible {
                delivered: 0.0,
                target,
            });
        }

        let objective: Vec<f64> = candidates.iter().map(|c| c.score).collect();
        let upper: Vec<f64> = candidates.iter().map(|c| c.capacity).collect();
        let values = self.solver.solve(&objective, &upper, target)?;
        if values.len() != candidates.len() {
            return Err(LpError::Solver(format!(
                "solver returned {} values for {} candidates",
                values.len(),
                candidates.len()
            )));
        }

        let mut raw = std::collections::BTreeMap::new();
        let mut delivered = 0.0;
        for (c, x) in candidates.iter().zip(values) {
            if x < -BOUND_TOLERANCE || x > c.capacity + BOUND_TOLERANCE {
                return Err(LpError::Solver(format!(
                    "{} out of bounds for {}: {x}",
                    c.vehicle.id, c.capacity
                )));
            }
            let x = x.clamp(0.0, c.capacity);
            delivered += x;
            raw.insert(c.vehicle.id.clone(), x);
        }

        if (delivered - target).abs() > EQUALITY_TOLERANCE {
            return Err(LpError::Infeasible { delivered, target });
        }

        Ok(Allocation {
            assignments: signed(raw, &ctx.signal),
            scores: Some(scores_of(&candidates)),
        })
    }
}

impl Dispatcher for LpDispatcher {
    fn name(&self) -> &'static str {
        "lp"
    }

    fn dispatch(&self, vehicles: &[Vehicle], ctx: &DispatchContext) -> Allocation {
        match self.dispatch_strict(vehicles, ctx) {
            Ok(allocation) => allocation,
            Err(e) => {
                tracing::debug!(signal = %ctx.signal.kind, error = %e, "lp dispatch fell back to smart");
                self.smart.dispatch(vehicles, ctx)
            }
        }
    }

    fn tunable_weights(&self) -> Option<SharedWeights> {
        self.smart.tunable_weights()
    }
}
