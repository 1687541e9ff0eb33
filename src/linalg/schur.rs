//! # Schur complement reduction
//!
//! Given the normal equations `A x = b` and a partition of the unknowns into a
//! kept set `a` and an eliminated set `b`, the reduced system over `a` is
//!
//! ```text
//! S = A_aa - A_ab · A_bb⁻¹ · A_ba
//! r = b_a  - A_ab · A_bb⁻¹ · b_b
//! ```
//!
//! Solving `S x_a = r` yields the same `x_a` as solving the full system. Damping
//! passed to [`schur_complement_system`] is applied to `A_bb` only, before the
//! inversion, as `A_bb(i,i) += alpha + beta·A_bb(i,i)`.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::linalg::{LinAlgError, LinAlgResult, block, check_partition, damp_diagonal, subvector};

/// Normal equations reduced onto the kept variables
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedSystem {
    pub lhs: DMatrix<f64>,
    pub rhs: DVector<f64>,
}

/// Eliminate `ids_b` from `A x = b`, keeping `ids_a` in the given order.
pub fn schur_complement_system(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    ids_a: &[usize],
    ids_b: &[usize],
    alpha: f64,
    beta: f64,
) -> LinAlgResult<ReducedSystem> {
    if !a.is_square() || a.nrows() != b.len() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "{}x{} system with rhs of length {}",
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }
    check_partition(a.nrows(), ids_a, ids_b)?;

    let a_aa = block(a, ids_a, ids_a);
    let b_a = subvector(b, ids_a);
    if ids_b.is_empty() {
        return Ok(ReducedSystem { lhs: a_aa, rhs: b_a });
    }

    let mut a_bb = block(a, ids_b, ids_b);
    damp_diagonal(&mut a_bb, alpha, beta);
    let a_ab = block(a, ids_a, ids_b);
    let b_b = subvector(b, ids_b);

    let cholesky = a_bb.cholesky().ok_or_else(|| {
        LinAlgError::SingularMatrix(format!(
            "eliminated block of size {} is not positive definite",
            ids_b.len()
        ))
    })?;

    // A_bb⁻¹ A_ba and A_bb⁻¹ b_b
    let a_bb_inv_a_ba = cholesky.solve(&a_ab.transpose());
    let a_bb_inv_b_b = cholesky.solve(&b_b);

    let lhs = a_aa - &a_ab * a_bb_inv_a_ba;
    let rhs = b_a - &a_ab * a_bb_inv_b_b;

    debug!(
        "Schur complement: kept {} variables, eliminated {}",
        ids_a.len(),
        ids_b.len()
    );

    Ok(ReducedSystem { lhs, rhs })
}
