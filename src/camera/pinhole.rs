//! Pinhole camera model
//!
//! # Projection
//!
//! For a point p = (x, y, z) in camera coordinates:
//!
//! ```text
//! u = fx · (x/z) + cx
//! v = fy · (y/z) + cy
//! ```
//!
//! # Jacobians
//!
//! With `p_cam = R(ω) p + t` and the projection Jacobian
//!
//! ```text
//! ∂π/∂p_cam = [fx/z    0    -fx·x/z²]
//!             [  0   fy/z   -fy·y/z²]
//! ```
//!
//! the blocks used by the bundle are
//!
//! ```text
//! ∂uv/∂p = ∂π/∂p_cam · R
//! ∂uv/∂ω = ∂π/∂p_cam · (-R [p]ₓ J_r(ω))
//! ∂uv/∂t = ∂π/∂p_cam
//! ```

use nalgebra::{Matrix2x3, SMatrix, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::camera::{CameraModelError, pose_from_kep, skew_symmetric, so3_right_jacobian};
use crate::core::frames::CameraFrame;

/// Smallest depth accepted in front of the camera
const MIN_DEPTH: f64 = 1e-6;

/// Linear intrinsic parameters (focal lengths and principal point, in pixels)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Default for PinholeIntrinsics {
    fn default() -> Self {
        Self {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        }
    }
}

impl PinholeIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, CameraModelError> {
        let intrinsics = Self { fx, fy, cx, cy };
        intrinsics.validate()?;
        Ok(intrinsics)
    }

    pub fn validate(&self) -> Result<(), CameraModelError> {
        if !(self.fx.is_finite() && self.fy.is_finite()) || self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !self.cx.is_finite() || !self.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    /// Project a point given in camera coordinates.
    pub fn project_camera_point(&self, p_cam: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if p_cam.z < MIN_DEPTH {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        Ok(Vector2::new(
            self.fx * p_cam.x / p_cam.z + self.cx,
            self.fy * p_cam.y / p_cam.z + self.cy,
        ))
    }

    /// Jacobian of [`Self::project_camera_point`] with respect to `p_cam`
    pub fn projection_jacobian(&self, p_cam: &Vector3<f64>) -> Result<Matrix2x3<f64>, CameraModelError> {
        if p_cam.z < MIN_DEPTH {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let inv_z = 1.0 / p_cam.z;
        let inv_z2 = inv_z * inv_z;
        Ok(Matrix2x3::new(
            self.fx * inv_z,
            0.0,
            -self.fx * p_cam.x * inv_z2,
            0.0,
            self.fy * inv_z,
            -self.fy * p_cam.y * inv_z2,
        ))
    }

    pub fn project(
        &self,
        frame: &CameraFrame,
        point: &Vector3<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        self.project_camera_point(&frame.transform(point))
    }

    /// Projection with the pose given as a raw kep vector
    pub fn project_kep(
        &self,
        kep: &Vector6<f64>,
        point: &Vector3<f64>,
    ) -> Result<Vector2<f64>, CameraModelError> {
        let (rotation, translation) = pose_from_kep(kep);
        self.project_camera_point(&(rotation * point + translation))
    }

    /// Derivative of the pixel with respect to the world point
    pub fn jacobian_point(
        &self,
        frame: &CameraFrame,
        point: &Vector3<f64>,
    ) -> Result<Matrix2x3<f64>, CameraModelError> {
        let d_proj = self.projection_jacobian(&frame.transform(point))?;
        Ok(d_proj * frame.rotation().matrix())
    }

    /// Derivative of the pixel with respect to the 6 kep entries
    pub fn jacobian_kep(
        &self,
        frame: &CameraFrame,
        point: &Vector3<f64>,
    ) -> Result<SMatrix<f64, 2, 6>, CameraModelError> {
        let d_proj = self.projection_jacobian(&frame.transform(point))?;
        let kep = frame.kep();
        let omega = Vector3::new(kep[0], kep[1], kep[2]);
        let d_rot =
            -(frame.rotation().matrix() * skew_symmetric(point) * so3_right_jacobian(&omega));

        let mut jacobian = SMatrix::<f64, 2, 6>::zeros();
        jacobian
            .fixed_view_mut::<2, 3>(0, 0)
            .copy_from(&(d_proj * d_rot));
        jacobian.fixed_view_mut::<2, 3>(0, 3).copy_from(&d_proj);
        Ok(jacobian)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::camera::{
        DifferenceScheme, JACOBIAN_TEST_TOLERANCE, NUMERICAL_DERIVATIVE_EPS, numerical_jacobian,
    };

    fn setup() -> (PinholeIntrinsics, CameraFrame, Vector3<f64>) {
        let intrinsics = PinholeIntrinsics::new(520.0, 515.0, 320.0, 240.0).unwrap();
        let frame = CameraFrame::from_kep(Vector6::new(0.1, -0.25, 0.05, 0.3, -0.2, 1.5));
        (intrinsics, frame, Vector3::new(0.4, -0.3, 4.0))
    }

    #[test]
    fn test_invalid_intrinsics_rejected() {
        assert_eq!(
            PinholeIntrinsics::new(0.0, 500.0, 320.0, 240.0),
            Err(CameraModelError::FocalLengthMustBePositive)
        );
        assert_eq!(
            PinholeIntrinsics::new(500.0, 500.0, f64::NAN, 240.0),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        );
    }

    #[test]
    fn test_point_behind_camera_fails() {
        let (intrinsics, frame, _) = setup();
        let behind = frame.rotation().inverse() * (Vector3::new(0.0, 0.0, -1.0) - frame.translation());
        assert_eq!(
            intrinsics.project(&frame, &behind),
            Err(CameraModelError::PointAtCameraCenter)
        );
    }

    #[test]
    fn test_project_matches_project_kep() {
        let (intrinsics, frame, point) = setup();
        let a = intrinsics.project(&frame, &point).unwrap();
        let b = intrinsics.project_kep(frame.kep(), &point).unwrap();
        assert!((a - b).norm() < 1e-12);
    }

    #[test]
    fn test_point_jacobian_matches_numerical() {
        let (intrinsics, frame, point) = setup();
        let analytic = intrinsics.jacobian_point(&frame, &point).unwrap();
        for scheme in [DifferenceScheme::Central, DifferenceScheme::Forward] {
            let numeric = numerical_jacobian(
                |p: &Vector3<f64>| intrinsics.project(&frame, p),
                &point,
                scheme,
                NUMERICAL_DERIVATIVE_EPS,
            )
            .unwrap();
            let tolerance = match scheme {
                DifferenceScheme::Central => JACOBIAN_TEST_TOLERANCE,
                DifferenceScheme::Forward => 1e-3,
            };
            assert!(
                (analytic - numeric).abs().max() < tolerance,
                "{scheme:?}: analytic {analytic} numeric {numeric}"
            );
        }
    }

    #[test]
    fn test_kep_jacobian_matches_numerical() {
        let (intrinsics, frame, point) = setup();
        let analytic = intrinsics.jacobian_kep(&frame, &point).unwrap();
        let numeric = numerical_jacobian(
            |kep: &Vector6<f64>| intrinsics.project_kep(kep, &point),
            frame.kep(),
            DifferenceScheme::Central,
            NUMERICAL_DERIVATIVE_EPS,
        )
        .unwrap();
        assert!(
            (analytic - numeric).abs().max() < JACOBIAN_TEST_TOLERANCE,
            "analytic {analytic} numeric {numeric}"
        );
    }
}
