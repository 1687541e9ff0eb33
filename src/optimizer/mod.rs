//! Damped Gauss-Newton refinement of the window
//!
//! Each round asks the scheduler for the marginalized window bundle, then
//! iterates:
//!
//! 1. solve the damped normal equations (fresh rows plus the prior) for `Δx`
//! 2. write `x + Δx` back into the camera and point records
//! 3. rebuild and accept the step if the normalized cost
//!    `(Σ residual² + bias(x)) / (n_unknowns + n_residuals)` decreased,
//!    otherwise restore the previous values
//!
//! Damping stays fixed; a step that does not decrease the cost is only retried
//! after the window changed, so consecutive rejections end the round.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::bundle::{BundleError, GlobalBundle};
use crate::config::OptimizerConfig;
use crate::core::window::WindowState;
use crate::logger::log_step;
use crate::marginalization::{MarginalizationError, MarginalizationScheduler, MarginalizingBias, SchedulerError};

/// Optimizer specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Marginalization(#[from] MarginalizationError),
}

/// Status of an optimization round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Relative cost reduction fell below the threshold
    Converged,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Too many consecutive steps increased the cost
    TooManyRejectedSteps,
    /// The damped system could not be solved (only reported in nothrow mode)
    NumericalFailure,
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::TooManyRejectedSteps => write!(f, "Too many rejected steps"),
            OptimizationStatus::NumericalFailure => write!(f, "Numerical failure"),
        }
    }
}

/// Summary statistics of one optimization round
#[derive(Debug, Clone)]
pub struct OptimizationSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub status: OptimizationStatus,
    pub total_time: Duration,
}

impl fmt::Display for OptimizationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Window Optimization Summary ===")?;
        writeln!(f, "Initial cost:      {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:        {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:    {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Iterations:        {}", self.iterations)?;
        writeln!(f, "Accepted steps:    {}", self.accepted_steps)?;
        writeln!(f, "Rejected steps:    {}", self.rejected_steps)?;
        writeln!(f, "Status:            {}", self.status)?;
        writeln!(f, "Total time:        {:?}", self.total_time)?;
        Ok(())
    }
}

/// Outer nonlinear loop over a marginalized window
#[derive(Debug, Clone, Default)]
pub struct BundleOptimizer {
    config: OptimizerConfig,
}

impl BundleOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Normalized cost of the current bundle values including the prior
    pub fn cost(bundle: &GlobalBundle, bias: &MarginalizingBias) -> Result<f64, OptimizerError> {
        let count = bundle.num_columns() + bundle.num_rows();
        if count == 0 {
            return Ok(0.0);
        }
        let ssq = bundle.residual().norm_squared();
        Ok((ssq + bias.bias(bundle.x())?) / count as f64)
    }

    /// Shrink the window, then refine every remaining unknown.
    pub fn optimize(
        &self,
        state: &mut WindowState,
        scheduler: &mut MarginalizationScheduler,
    ) -> Result<OptimizationSummary, OptimizerError> {
        let start = Instant::now();
        let mut bundle = scheduler.global_bundle(state, true)?;
        let mut cost = Self::cost(&bundle, scheduler.bias())?;
        let initial_cost = cost;

        let mut iterations = 0;
        let mut accepted_steps = 0;
        let mut rejected_steps = 0;
        let mut consecutive_rejections = 0;
        let mut status = OptimizationStatus::MaxIterationsReached;

        while iterations < self.config.max_iterations {
            iterations += 1;
            let dx = match scheduler.bias().solve(bundle.jacobian()?, bundle.x(), bundle.residual()) {
                Ok(dx) => dx,
                Err(e) if self.config.nothrow => {
                    warn!("Iteration {iterations}: {e}, keeping the last accepted state");
                    status = OptimizationStatus::NumericalFailure;
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let candidate = bundle.x() + &dx;
            bundle.copy_out(&candidate, &mut state.cameras, &mut state.points)?;
            let evaluated = match scheduler.global_bundle(state, false) {
                Ok(rebuilt) => Some((Self::cost(&rebuilt, scheduler.bias())?, rebuilt)),
                // A point moved behind a camera: treat like a cost increase.
                Err(SchedulerError::Bundle(BundleError::Projection { time, point, .. })) => {
                    log_step!(
                        self.config.verbose,
                        "Iteration {iterations}: point {point} leaves camera {time}, rejecting step"
                    );
                    None
                }
                Err(e) => return Err(e.into()),
            };

            match evaluated {
                Some((new_cost, rebuilt)) if new_cost < cost => {
                    let reduction = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
                    log_step!(
                        self.config.verbose,
                        "Iteration {iterations}: cost {cost:.6e} -> {new_cost:.6e}, |dx| = {:.3e}",
                        dx.norm()
                    );
                    bundle = rebuilt;
                    cost = new_cost;
                    accepted_steps += 1;
                    consecutive_rejections = 0;
                    if reduction < self.config.min_relative_reduction {
                        status = OptimizationStatus::Converged;
                        break;
                    }
                }
                _ => {
                    bundle.copy_out(&bundle.x().clone(), &mut state.cameras, &mut state.points)?;
                    rejected_steps += 1;
                    consecutive_rejections += 1;
                    log_step!(
                        self.config.verbose,
                        "Iteration {iterations}: step rejected ({consecutive_rejections} in a row)"
                    );
                    if consecutive_rejections >= self.config.max_rejected_steps {
                        status = OptimizationStatus::TooManyRejectedSteps;
                        break;
                    }
                }
            }
        }

        let summary = OptimizationSummary {
            initial_cost,
            final_cost: cost,
            iterations,
            accepted_steps,
            rejected_steps,
            status,
            total_time: start.elapsed(),
        };
        log_step!(self.config.verbose, "{summary}");
        Ok(summary)
    }
}
