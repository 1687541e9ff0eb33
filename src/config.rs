//! Configuration of the sliding-window backend
//!
//! All settings are plain values with sensible defaults and chained `with_*`
//! setters, so a caller only spells out what differs:
//!
//! ```
//! use sliding_bundle::config::{MarginalizationTarget, WindowConfig};
//!
//! let config = WindowConfig::default()
//!     .with_target_window_size(8)
//!     .with_policy(MarginalizationTarget::Points)
//!     .with_damping(1e-2, 1e-2);
//! assert_eq!(config.scheduler.target_window_size, 8);
//! ```

use serde::{Deserialize, Serialize};

use crate::camera::{DifferenceScheme, NUMERICAL_DERIVATIVE_EPS, PinholeIntrinsics};

/// How a Jacobian block is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JacobianMode {
    #[default]
    Analytic,
    /// Finite differences against the analytic projector
    Numerical(DifferenceScheme),
}

/// Normal-equation builder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleConfig {
    pub intrinsics: PinholeIntrinsics,
    pub point_jacobian: JacobianMode,
    pub camera_jacobian: JacobianMode,
    /// Step used by numerical Jacobians
    pub numerical_step: f64,
    /// Ignore observation frames that have no camera record instead of failing
    pub skip_missing_cameras: bool,
    /// Minimum surviving observations per non-marginalized point
    pub min_point_observations: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            intrinsics: PinholeIntrinsics::default(),
            point_jacobian: JacobianMode::Analytic,
            camera_jacobian: JacobianMode::Analytic,
            numerical_step: NUMERICAL_DERIVATIVE_EPS,
            skip_missing_cameras: false,
            min_point_observations: 1,
        }
    }
}

impl BundleConfig {
    pub fn with_intrinsics(mut self, intrinsics: PinholeIntrinsics) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    pub fn with_jacobian_modes(mut self, point: JacobianMode, camera: JacobianMode) -> Self {
        self.point_jacobian = point;
        self.camera_jacobian = camera;
        self
    }

    pub fn with_numerical_step(mut self, step: f64) -> Self {
        self.numerical_step = step;
        self
    }

    pub fn with_skip_missing_cameras(mut self, skip: bool) -> Self {
        self.skip_missing_cameras = skip;
        self
    }

    pub fn with_min_point_observations(mut self, count: usize) -> Self {
        self.min_point_observations = count;
        self
    }
}

/// Which variables the scheduler eliminates explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarginalizationTarget {
    /// Eliminate the victim's points, then the victim camera
    #[default]
    Points,
    /// Approximate: eliminate only cameras and abandon points left without an
    /// observing camera, without Schur elimination against their factors
    Cameras,
}

/// Window scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of active plus linearized cameras
    pub target_window_size: usize,
    pub policy: MarginalizationTarget,
    /// Starvation threshold on the fraction of a camera's points seen by the newest frame
    pub min_visible_fraction: f64,
    /// Cameras storing fewer points than this are retired first
    pub min_stored_points: usize,
    /// Number of newest cameras never chosen as victims
    pub num_protected_newest: usize,
    /// Log every scheduling decision at info level
    pub verbose: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_window_size: 10,
            policy: MarginalizationTarget::Points,
            min_visible_fraction: 0.05,
            min_stored_points: 10,
            num_protected_newest: 2,
            verbose: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_target_window_size(mut self, size: usize) -> Self {
        self.target_window_size = size;
        self
    }

    pub fn with_policy(mut self, policy: MarginalizationTarget) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_starvation_thresholds(mut self, min_visible_fraction: f64, min_stored_points: usize) -> Self {
        self.min_visible_fraction = min_visible_fraction;
        self.min_stored_points = min_stored_points;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Tikhonov damping `A(i,i) += alpha + beta·A(i,i)`, applied at solve time only
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DampingConfig {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for DampingConfig {
    fn default() -> Self {
        Self {
            alpha: 1e-2,
            beta: 1e-2,
        }
    }
}

impl DampingConfig {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    pub fn none() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Outer damped Gauss-Newton loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    /// Stop once the relative cost reduction of an accepted step falls below this
    pub min_relative_reduction: f64,
    /// Stop after this many consecutive rejected steps
    pub max_rejected_steps: usize,
    /// Report numeric failures through the summary instead of an error
    pub nothrow: bool,
    pub verbose: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            min_relative_reduction: 1e-6,
            max_rejected_steps: 3,
            nothrow: false,
            verbose: false,
        }
    }
}

impl OptimizerConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_min_relative_reduction(mut self, reduction: f64) -> Self {
        self.min_relative_reduction = reduction;
        self
    }

    pub fn with_nothrow(mut self, nothrow: bool) -> Self {
        self.nothrow = nothrow;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Complete configuration bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub bundle: BundleConfig,
    pub scheduler: SchedulerConfig,
    pub damping: DampingConfig,
    pub optimizer: OptimizerConfig,
}

impl WindowConfig {
    pub fn with_target_window_size(mut self, size: usize) -> Self {
        self.scheduler.target_window_size = size;
        self
    }

    pub fn with_policy(mut self, policy: MarginalizationTarget) -> Self {
        self.scheduler.policy = policy;
        self
    }

    pub fn with_damping(mut self, alpha: f64, beta: f64) -> Self {
        self.damping = DampingConfig::new(alpha, beta);
        self
    }

    pub fn with_intrinsics(mut self, intrinsics: PinholeIntrinsics) -> Self {
        self.bundle.intrinsics = intrinsics;
        self
    }

    pub fn with_jacobian_modes(mut self, point: JacobianMode, camera: JacobianMode) -> Self {
        self.bundle = self.bundle.with_jacobian_modes(point, camera);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.scheduler.verbose = verbose;
        self.optimizer.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WindowConfig::default();
        assert_eq!(config.damping, DampingConfig::new(1e-2, 1e-2));
        assert_eq!(config.scheduler.min_visible_fraction, 0.05);
        assert_eq!(config.scheduler.num_protected_newest, 2);
        assert_eq!(config.scheduler.policy, MarginalizationTarget::Points);
        assert_eq!(config.bundle.point_jacobian, JacobianMode::Analytic);
    }

    #[test]
    fn test_builder_methods() {
        let config = WindowConfig::default()
            .with_target_window_size(4)
            .with_policy(MarginalizationTarget::Cameras)
            .with_jacobian_modes(
                JacobianMode::Numerical(DifferenceScheme::Central),
                JacobianMode::Analytic,
            )
            .with_verbose(true);
        assert_eq!(config.scheduler.target_window_size, 4);
        assert_eq!(config.scheduler.policy, MarginalizationTarget::Cameras);
        assert!(config.optimizer.verbose);
        assert_eq!(
            config.bundle.point_jacobian,
            JacobianMode::Numerical(DifferenceScheme::Central)
        );
    }
}
