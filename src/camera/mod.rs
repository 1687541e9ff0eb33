//! Camera projection and its derivatives
//!
//! Cameras are parameterized by the packed external vector ("kep")
//!
//! ```text
//! kep = [ωx, ωy, ωz, tx, ty, tz]
//! p_cam = R(ω) · p_world + t
//! ```
//!
//! where `R(ω)` is the SO(3) exponential of the rotation vector `ω`. Intrinsics are
//! fixed configuration and never optimized.
//!
//! The analytic Jacobians live in [`pinhole`]; [`numerical`] provides central and
//! forward difference fallbacks used to cross-check them.

pub mod numerical;
pub mod pinhole;

pub use numerical::{DifferenceScheme, numerical_jacobian};
pub use pinhole::PinholeIntrinsics;

use nalgebra::{Matrix3, Rotation3, Vector3, Vector6};
use thiserror::Error;

/// Step size used by the numerical Jacobians
pub const NUMERICAL_DERIVATIVE_EPS: f64 = 1e-6;

/// Tolerance for analytic vs numerical Jacobian comparisons in tests
pub const JACOBIAN_TEST_TOLERANCE: f64 = 1e-5;

/// Squared rotation angle below which series expansions are used
const SMALL_ANGLE_THRESHOLD: f64 = 1e-10;

/// Camera model errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("NumericalError: {0}")]
    NumericalError(String),
}

/// Rotation and translation encoded by a kep vector
pub fn pose_from_kep(kep: &Vector6<f64>) -> (Rotation3<f64>, Vector3<f64>) {
    let omega = Vector3::new(kep[0], kep[1], kep[2]);
    let translation = Vector3::new(kep[3], kep[4], kep[5]);
    (Rotation3::new(omega), translation)
}

/// Inverse of [`pose_from_kep`]
pub fn kep_from_rotation(rotation: &Rotation3<f64>, translation: &Vector3<f64>) -> Vector6<f64> {
    let omega = rotation.scaled_axis();
    Vector6::new(
        omega.x,
        omega.y,
        omega.z,
        translation.x,
        translation.y,
        translation.z,
    )
}

pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Right Jacobian of the SO(3) exponential
///
/// ```text
/// J_r(ω) = I - (1 - cos θ)/θ² [ω]ₓ + (θ - sin θ)/θ³ [ω]ₓ²
/// ```
pub fn so3_right_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta_squared = omega.norm_squared();
    let omega_skew = skew_symmetric(omega);
    let omega_skew_squared = omega_skew * omega_skew;

    if theta_squared <= SMALL_ANGLE_THRESHOLD {
        Matrix3::identity() - 0.5 * omega_skew + omega_skew_squared / 6.0
    } else {
        let theta = theta_squared.sqrt();
        Matrix3::identity() - (1.0 - theta.cos()) / theta_squared * omega_skew
            + (theta - theta.sin()) / (theta_squared * theta) * omega_skew_squared
    }
}
