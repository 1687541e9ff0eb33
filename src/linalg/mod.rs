//! Linear algebra utilities
//!
//! Jacobians are assembled as sparse faer matrices; the normal equations of a
//! sliding window are small enough to be handled densely with nalgebra:
//! - sparse to dense conversion of Jacobians
//! - Levenberg-style diagonal damping
//! - symmetric (Cholesky) solves
//! - block extraction by index lists
//! - the Schur complement reduction in [`schur`]

pub mod schur;

pub use schur::{ReducedSystem, schur_complement_system};

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Type alias for sparse matrices using faer
pub type SparseMatrix = faer::sparse::SparseColMat<usize, f64>;

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix is not positive definite after damping
    #[error("Singular matrix: {0}")]
    SingularMatrix(String),
    /// Operand sizes do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// Failed to create sparse matrix
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),
    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Dense copy of a sparse matrix
pub fn sparse_to_dense(sparse: &SparseMatrix) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(sparse.nrows(), sparse.ncols());
    let symbolic = sparse.symbolic();
    for col in 0..sparse.ncols() {
        let row_indices = symbolic.row_idx_of_col_raw(col);
        let col_values = sparse.val_of_col(col);
        for (&row, value) in row_indices.iter().zip(col_values) {
            dense[(row, col)] += *value;
        }
    }
    dense
}

/// `A(i,i) += alpha + beta·A(i,i)` for every diagonal entry
pub fn damp_diagonal(matrix: &mut DMatrix<f64>, alpha: f64, beta: f64) {
    for i in 0..matrix.nrows().min(matrix.ncols()) {
        let diagonal = matrix[(i, i)];
        matrix[(i, i)] = diagonal + alpha + beta * diagonal;
    }
}

/// Solve the damped symmetric system `(A + damping) x = b` by Cholesky.
pub fn solve_symm(
    matrix: &DMatrix<f64>,
    rhs: &DVector<f64>,
    alpha: f64,
    beta: f64,
) -> LinAlgResult<DVector<f64>> {
    if !matrix.is_square() || matrix.nrows() != rhs.len() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "{}x{} system with rhs of length {}",
            matrix.nrows(),
            matrix.ncols(),
            rhs.len()
        )));
    }
    let mut damped = matrix.clone();
    damp_diagonal(&mut damped, alpha, beta);
    let cholesky = damped.cholesky().ok_or_else(|| {
        LinAlgError::SingularMatrix(format!(
            "{n}x{n} damped normal equations are not positive definite",
            n = matrix.nrows()
        ))
    })?;
    Ok(cholesky.solve(rhs))
}

/// Rows `rows` and columns `cols` of `matrix`
pub fn block(matrix: &DMatrix<f64>, rows: &[usize], cols: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), cols.len(), |i, j| matrix[(rows[i], cols[j])])
}

/// Entries `indices` of `vector`
pub fn subvector(vector: &DVector<f64>, indices: &[usize]) -> DVector<f64> {
    DVector::from_fn(indices.len(), |i, _| vector[indices[i]])
}

/// Largest absolute difference between `matrix` and its transpose
pub fn max_asymmetry(matrix: &DMatrix<f64>) -> f64 {
    (matrix - matrix.transpose()).abs().max()
}

/// Replace `matrix` by `(matrix + matrixᵀ) / 2`.
pub fn symmetrize(matrix: &mut DMatrix<f64>) {
    let transposed = matrix.transpose();
    *matrix += transposed;
    *matrix *= 0.5;
}

/// Validate that every index is in range and that the two index sets are disjoint.
pub fn check_partition(dim: usize, ids_a: &[usize], ids_b: &[usize]) -> LinAlgResult<()> {
    let mut seen = vec![false; dim];
    for &i in ids_a.iter().chain(ids_b) {
        if i >= dim {
            return Err(LinAlgError::InvalidInput(format!(
                "index {i} out of range for dimension {dim}"
            )));
        }
        if seen[i] {
            return Err(LinAlgError::InvalidInput(format!(
                "index {i} appears more than once in the partition"
            )));
        }
        seen[i] = true;
    }
    Ok(())
}
