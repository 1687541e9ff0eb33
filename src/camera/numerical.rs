//! Finite-difference Jacobians of the projection

use nalgebra::{SMatrix, SVector, Vector2};
use serde::{Deserialize, Serialize};

use crate::camera::CameraModelError;

/// Finite-difference scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DifferenceScheme {
    /// (f(x + h) - f(x - h)) / 2h
    #[default]
    Central,
    /// (f(x + h) - f(x)) / h
    Forward,
}

/// 2×N Jacobian of a pixel-valued function by finite differences.
pub fn numerical_jacobian<const N: usize, F>(
    f: F,
    x: &SVector<f64, N>,
    scheme: DifferenceScheme,
    eps: f64,
) -> Result<SMatrix<f64, 2, N>, CameraModelError>
where
    F: Fn(&SVector<f64, N>) -> Result<Vector2<f64>, CameraModelError>,
{
    if !(eps.is_finite() && eps > 0.0) {
        return Err(CameraModelError::NumericalError(format!(
            "invalid finite-difference step {eps}"
        )));
    }

    let mut jacobian = SMatrix::<f64, 2, N>::zeros();
    let center = match scheme {
        DifferenceScheme::Forward => Some(f(x)?),
        DifferenceScheme::Central => None,
    };

    for i in 0..N {
        let mut plus = *x;
        plus[i] += eps;
        let column = match center {
            Some(f0) => (f(&plus)? - f0) / eps,
            None => {
                let mut minus = *x;
                minus[i] -= eps;
                (f(&plus)? - f(&minus)?) / (2.0 * eps)
            }
        };
        jacobian.set_column(i, &column);
    }
    Ok(jacobian)
}
