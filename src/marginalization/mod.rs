//! Marginalization of old window variables
//!
//! - [`MarginalizingBias`]: the running prior and the Schur elimination that grows it
//! - [`MarginalizationIds`]: keep/eliminate column sets for one elimination step
//! - [`MarginalizationScheduler`]: chooses which cameras leave the window and
//!   drives the ledgers, the builder and the prior through each retirement

pub mod bias;
pub mod ids;
pub mod scheduler;

pub use bias::MarginalizingBias;
pub use ids::MarginalizationIds;
pub use scheduler::{MarginalizationScheduler, SchedulerError};

use thiserror::Error;

use crate::core::registry::Uuid;
use crate::linalg::LinAlgError;

/// Marginalization specific error types
#[derive(Debug, Clone, Error)]
pub enum MarginalizationError {
    /// The Jacobian does not have the column count of the last `update_indices` layout
    #[error("Jacobian has {actual} columns but the registered layout has {expected}")]
    LayoutMismatch { expected: usize, actual: usize },
    #[error("Invalid column layout: {0}")]
    InvalidLayout(String),
    /// A prior variable has no column in the current layout
    #[error("Prior variable {0} is missing from the current layout, call update_indices")]
    StaleLayout(Uuid),
    #[error("Variable {0} was already eliminated")]
    ReintroducedVariable(Uuid),
    /// An eliminated row couples to a variable that is neither kept nor eliminated
    #[error("Row {row} touches column {column} ({uuid}) outside the keep and eliminate sets")]
    OpenMarkovBlanket { row: usize, column: usize, uuid: Uuid },
    #[error("Reduced prior is not symmetric (max deviation {0:e})")]
    AsymmetricPrior(f64),
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
}
