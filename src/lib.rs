pub mod bundle;
pub mod camera;
pub mod config;
pub mod core;
pub mod error;
pub mod linalg;
pub mod logger;
pub mod marginalization;
pub mod optimizer;

pub use bundle::{BundleError, BundleInputs, GlobalBundle};
pub use config::{
    BundleConfig, DampingConfig, JacobianMode, MarginalizationTarget, OptimizerConfig,
    SchedulerConfig, WindowConfig,
};
pub use core::window::WindowState;
pub use error::{WindowError, WindowResult};
pub use logger::{init_logger, init_logger_with_level};
pub use marginalization::{
    MarginalizationError, MarginalizationIds, MarginalizationScheduler, MarginalizingBias,
    SchedulerError,
};
pub use optimizer::{BundleOptimizer, OptimizationStatus, OptimizationSummary, OptimizerError};
