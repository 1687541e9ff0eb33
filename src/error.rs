//! Error types for the sliding-window backend
//!
//! Every module reports its own `thiserror` enum; [`WindowError`] folds them into
//! one type for callers that only want to know which layer failed.

use thiserror::Error;

use crate::bundle::BundleError;
use crate::camera::CameraModelError;
use crate::core::frames::FrameError;
use crate::core::ledger::LedgerError;
use crate::core::registry::RegistryError;
use crate::linalg::LinAlgError;
use crate::marginalization::{MarginalizationError, SchedulerError};
use crate::optimizer::OptimizerError;

/// Main result type of the crate
pub type WindowResult<T> = Result<T, WindowError>;

/// Main error type of the crate
#[derive(Debug, Clone, Error)]
pub enum WindowError {
    /// Observation, camera or point records are inconsistent
    #[error("Frame error: {0}")]
    Frame(String),

    /// Lifecycle ledger or variable registry misuse
    #[error("State error: {0}")]
    State(String),

    /// Projection or Jacobian evaluation failed
    #[error("Camera model error: {0}")]
    CameraModel(String),

    /// Normal-equation assembly failed
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Prior maintenance or Schur elimination failed
    #[error("Marginalization error: {0}")]
    Marginalization(String),

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Outer optimization loop failed
    #[error("Solver error: {0}")]
    Solver(String),
}

impl From<FrameError> for WindowError {
    fn from(err: FrameError) -> Self {
        WindowError::Frame(err.to_string())
    }
}

impl From<LedgerError> for WindowError {
    fn from(err: LedgerError) -> Self {
        WindowError::State(err.to_string())
    }
}

impl From<RegistryError> for WindowError {
    fn from(err: RegistryError) -> Self {
        WindowError::State(err.to_string())
    }
}

impl From<CameraModelError> for WindowError {
    fn from(err: CameraModelError) -> Self {
        WindowError::CameraModel(err.to_string())
    }
}

impl From<BundleError> for WindowError {
    fn from(err: BundleError) -> Self {
        WindowError::Bundle(err.to_string())
    }
}

impl From<MarginalizationError> for WindowError {
    fn from(err: MarginalizationError) -> Self {
        WindowError::Marginalization(err.to_string())
    }
}

impl From<SchedulerError> for WindowError {
    fn from(err: SchedulerError) -> Self {
        WindowError::Marginalization(err.to_string())
    }
}

impl From<LinAlgError> for WindowError {
    fn from(err: LinAlgError) -> Self {
        WindowError::LinearAlgebra(err.to_string())
    }
}

impl From<OptimizerError> for WindowError {
    fn from(err: OptimizerError) -> Self {
        WindowError::Solver(err.to_string())
    }
}
