//! # Marginalizing bias
//!
//! Running prior left behind by eliminated variables, kept in information form
//! over registry identifiers:
//!
//! ```text
//! Q(x) = xᵀ·L·x − 2·xᵀ·r + c
//! ```
//!
//! Each call to [`MarginalizingBias::marginalize`] takes the Jacobian rows that
//! touch the eliminated columns, linearizes them around the given values as
//! `‖(residual + J·x) − J·x'‖²`, adds the current prior, and eliminates the
//! requested variables with a Schur complement. With `H_bb = V·Λ·Vᵀ` restricted
//! to the eigenpairs above the cutoff, the reduction is formed symmetrically:
//!
//! ```text
//! W  = H_kb·V·Λ^{-1/2}      u  = Λ^{-1/2}·Vᵀ·g_b
//! L' = H_kk − W·Wᵀ          r' = g_k − W·u          c' = c − uᵀ·u
//! ```
//!
//! Eliminating a block that only carries gauge or depth-deficient information
//! therefore does not fail. The reduced prior is then clamped to the positive
//! semi-definite cone: eigenvalues of `L'` below the cutoff are zeroed, `r'` is
//! projected onto the range of `L'`, and `Q` is kept in the centered form
//!
//! ```text
//! Q(x) = (x − x*)ᵀ·L·(x − x*) + m,    L·x* = r,    m ≥ 0
//! ```
//!
//! so that the prior never rewards moving away from its linearization.
//!
//! Because the prior is addressed by [`Uuid`], it survives column renumbering:
//! [`MarginalizingBias::update_indices`] must be called with the layout of each
//! new Jacobian before it is used for elimination or solving. Prior variables
//! missing from the new layout are eliminated from the prior alone.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::debug;

use crate::config::DampingConfig;
use crate::core::registry::Uuid;
use crate::linalg::{
    SparseMatrix, block, check_partition, max_asymmetry, solve_symm, sparse_to_dense, subvector,
    symmetrize,
};
use crate::marginalization::MarginalizationError;

/// Relative eigenvalue cutoff, about the square root of machine epsilon
const EIGENVALUE_CUTOFF: f64 = 1.5e-8;

/// Relative asymmetry accepted before symmetrizing a reduced prior
const ASYMMETRY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct MarginalizingBias {
    damping: DampingConfig,
    /// Prior variables, in the row order of `lhs_ka` and `rhs_ka`
    ids_ka: Vec<Uuid>,
    lhs_ka: DMatrix<f64>,
    rhs_ka: DVector<f64>,
    offset: f64,
    /// Minimizer `x*` of the prior, in the row order of `lhs_ka`
    minimizer: DVector<f64>,
    /// Value `m` of the prior at its minimizer
    minimum: f64,
    eliminated: HashSet<Uuid>,
    columns: HashMap<Uuid, usize>,
    uuids: Vec<Uuid>,
}

impl MarginalizingBias {
    /// Create an empty prior. Damping is only applied by [`Self::solve`].
    pub fn new(damping: DampingConfig) -> Self {
        Self {
            damping,
            ids_ka: Vec::new(),
            lhs_ka: DMatrix::zeros(0, 0),
            rhs_ka: DVector::zeros(0),
            offset: 0.0,
            minimizer: DVector::zeros(0),
            minimum: 0.0,
            eliminated: HashSet::new(),
            columns: HashMap::new(),
            uuids: Vec::new(),
        }
    }

    /// Re-base the prior onto a new `uuid -> column` layout.
    pub fn update_indices(&mut self, layout: &HashMap<Uuid, usize>) -> Result<(), MarginalizationError> {
        let mut slots: Vec<Option<Uuid>> = vec![None; layout.len()];
        for (&uuid, &column) in layout {
            if self.eliminated.contains(&uuid) {
                return Err(MarginalizationError::ReintroducedVariable(uuid));
            }
            let slot = slots.get_mut(column).ok_or_else(|| {
                MarginalizationError::InvalidLayout(format!(
                    "column {column} out of range for {} variables",
                    layout.len()
                ))
            })?;
            if let Some(previous) = slot.replace(uuid) {
                return Err(MarginalizationError::InvalidLayout(format!(
                    "column {column} assigned to both {previous} and {uuid}"
                )));
            }
        }
        // Distinct in-range columns fill every slot.
        let uuids = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| MarginalizationError::InvalidLayout("incomplete layout".to_string()))?;

        let (keep, prune): (Vec<usize>, Vec<usize>) =
            (0..self.ids_ka.len()).partition(|&i| layout.contains_key(&self.ids_ka[i]));
        if !prune.is_empty() {
            let (lhs, rhs, offset) =
                eliminate(&self.lhs_ka, &self.rhs_ka, self.offset, &keep, &prune)?;
            debug!(
                "Pruned {} prior variables absent from the new layout, {} remain",
                prune.len(),
                keep.len()
            );
            self.eliminated.extend(prune.iter().map(|&i| self.ids_ka[i]));
            let ids = keep.iter().map(|&i| self.ids_ka[i]).collect();
            self.install(ids, lhs, &rhs, offset);
        }

        self.columns = layout.clone();
        self.uuids = uuids;
        Ok(())
    }

    /// Eliminate the columns `ids_b` of `jacobian`, keeping their coupling to
    /// `ids_a` (and to the existing prior) as new prior information.
    ///
    /// `residual` and `x` are the residual vector and the unknown values the
    /// Jacobian was linearized around. Rows touching variables eliminated by an
    /// earlier call are skipped; any other row touching a column outside
    /// `ids_a ∪ ids_b` is rejected.
    pub fn marginalize(
        &mut self,
        jacobian: &SparseMatrix,
        residual: &DVector<f64>,
        x: &DVector<f64>,
        ids_a: &[usize],
        ids_b: &[usize],
    ) -> Result<(), MarginalizationError> {
        let ncols = self.check_dimensions(jacobian, x, residual)?;
        check_partition(ncols, ids_a, ids_b)?;
        for &column in ids_a.iter().chain(ids_b) {
            let uuid = self.uuids[column];
            if self.eliminated.contains(&uuid) {
                return Err(MarginalizationError::ReintroducedVariable(uuid));
            }
        }
        if ids_b.is_empty() {
            return Ok(());
        }

        let (row_ids, rows) = rows_touching(jacobian, ids_b);
        let mut in_partition = vec![false; ncols];
        for &column in ids_a.iter().chain(ids_b) {
            in_partition[column] = true;
        }

        let mut selected = Vec::with_capacity(row_ids.len());
        let mut skipped = 0;
        'rows: for (i, &row) in row_ids.iter().enumerate() {
            let mut outside = None;
            for column in 0..ncols {
                if rows[(i, column)] == 0.0 {
                    continue;
                }
                if self.eliminated.contains(&self.uuids[column]) {
                    skipped += 1;
                    continue 'rows;
                }
                if !in_partition[column] && outside.is_none() {
                    outside = Some(column);
                }
            }
            if let Some(column) = outside {
                return Err(MarginalizationError::OpenMarkovBlanket {
                    row,
                    column,
                    uuid: self.uuids[column],
                });
            }
            selected.push(i);
        }

        // Local ordering: kept Jacobian columns, remaining prior variables, eliminated columns.
        let eliminated_uuids: Vec<Uuid> = ids_b.iter().map(|&c| self.uuids[c]).collect();
        let mut kept_uuids: Vec<Uuid> = ids_a.iter().map(|&c| self.uuids[c]).collect();
        let carried: Vec<Uuid> = self
            .ids_ka
            .iter()
            .filter(|uuid| !kept_uuids.contains(uuid) && !eliminated_uuids.contains(uuid))
            .copied()
            .collect();
        kept_uuids.extend(carried);
        let local: HashMap<Uuid, usize> = kept_uuids
            .iter()
            .chain(&eliminated_uuids)
            .enumerate()
            .map(|(i, uuid)| (*uuid, i))
            .collect();
        let n = local.len();

        let mut h = DMatrix::zeros(n, n);
        let mut g = DVector::zeros(n);
        let mut c = self.offset;
        for &i in &selected {
            let mut v = DVector::zeros(n);
            let mut z = residual[row_ids[i]];
            for &column in ids_a.iter().chain(ids_b) {
                let value = rows[(i, column)];
                v[local[&self.uuids[column]]] = value;
                z += value * x[column];
            }
            h += &v * v.transpose();
            g += &v * z;
            c += z * z;
        }
        for (p, uuid_p) in self.ids_ka.iter().enumerate() {
            let lp = local[uuid_p];
            g[lp] += self.rhs_ka[p];
            for (q, uuid_q) in self.ids_ka.iter().enumerate() {
                h[(lp, local[uuid_q])] += self.lhs_ka[(p, q)];
            }
        }

        let keep: Vec<usize> = (0..kept_uuids.len()).collect();
        let elim: Vec<usize> = (kept_uuids.len()..n).collect();
        let (lhs, rhs, offset) = eliminate(&h, &g, c, &keep, &elim)?;

        debug!(
            "Marginalized {} variables from {} rows ({} skipped), prior now holds {} variables",
            eliminated_uuids.len(),
            selected.len(),
            skipped,
            kept_uuids.len()
        );

        self.install(kept_uuids, lhs, &rhs, offset);
        self.eliminated.extend(eliminated_uuids);
        Ok(())
    }

    /// Store a reduced prior after clamping it to the positive semi-definite cone.
    fn install(&mut self, ids: Vec<Uuid>, lhs: DMatrix<f64>, rhs: &DVector<f64>, offset: f64) {
        let projection = project_psd(lhs, rhs, offset);
        if projection.clamped > 0 {
            debug!(
                "Clamped {} of {} prior eigenvalues below the cutoff",
                projection.clamped,
                ids.len()
            );
        }
        self.ids_ka = ids;
        self.offset = projection.minimum + projection.rhs.dot(&projection.minimizer);
        self.lhs_ka = projection.lhs;
        self.rhs_ka = projection.rhs;
        self.minimizer = projection.minimizer;
        self.minimum = projection.minimum;
    }

    /// Damped Gauss-Newton update of all columns from fresh rows plus the prior.
    pub fn solve(
        &self,
        jacobian: &SparseMatrix,
        x0: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<DVector<f64>, MarginalizationError> {
        self.check_dimensions(jacobian, x0, residual)?;
        let j = sparse_to_dense(jacobian);
        let mut a = j.tr_mul(&j);
        let mut b = j.tr_mul(residual);

        let columns = self.prior_columns()?;
        let gradient = &self.lhs_ka * (&self.minimizer - subvector(x0, &columns));
        for (p, &cp) in columns.iter().enumerate() {
            b[cp] += gradient[p];
            for (q, &cq) in columns.iter().enumerate() {
                a[(cp, cq)] += self.lhs_ka[(p, q)];
            }
        }

        Ok(solve_symm(&a, &b, self.damping.alpha, self.damping.beta)?)
    }

    /// Value of the prior quadratic at `x`, given in the current layout
    pub fn bias(&self, x: &DVector<f64>) -> Result<f64, MarginalizationError> {
        if x.len() != self.uuids.len() {
            return Err(MarginalizationError::LayoutMismatch {
                expected: self.uuids.len(),
                actual: x.len(),
            });
        }
        let d = subvector(x, &self.prior_columns()?) - &self.minimizer;
        Ok(d.dot(&(&self.lhs_ka * &d)) + self.minimum)
    }

    fn prior_columns(&self) -> Result<Vec<usize>, MarginalizationError> {
        self.ids_ka
            .iter()
            .map(|uuid| {
                self.columns
                    .get(uuid)
                    .copied()
                    .ok_or(MarginalizationError::StaleLayout(*uuid))
            })
            .collect()
    }

    fn check_dimensions(
        &self,
        jacobian: &SparseMatrix,
        x: &DVector<f64>,
        residual: &DVector<f64>,
    ) -> Result<usize, MarginalizationError> {
        if jacobian.ncols() != self.uuids.len() {
            return Err(MarginalizationError::LayoutMismatch {
                expected: self.uuids.len(),
                actual: jacobian.ncols(),
            });
        }
        if x.len() != jacobian.ncols() || residual.len() != jacobian.nrows() {
            return Err(MarginalizationError::DimensionMismatch(format!(
                "{}x{} Jacobian with {} unknowns and {} residuals",
                jacobian.nrows(),
                jacobian.ncols(),
                x.len(),
                residual.len()
            )));
        }
        Ok(jacobian.ncols())
    }

    pub fn damping(&self) -> DampingConfig {
        self.damping
    }

    pub fn lhs(&self) -> &DMatrix<f64> {
        &self.lhs_ka
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs_ka
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Smallest value the prior takes
    pub fn minimum(&self) -> f64 {
        self.minimum
    }

    /// Variables carried by the prior, in matrix order
    pub fn ids(&self) -> &[Uuid] {
        &self.ids_ka
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.ids_ka.contains(&uuid)
    }

    pub fn is_eliminated(&self, uuid: Uuid) -> bool {
        self.eliminated.contains(&uuid)
    }

    pub fn len(&self) -> usize {
        self.ids_ka.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids_ka.is_empty()
    }
}

/// Dense copy of the rows of `jacobian` with a nonzero entry in any of `columns`
fn rows_touching(jacobian: &SparseMatrix, columns: &[usize]) -> (Vec<usize>, DMatrix<f64>) {
    let symbolic = jacobian.symbolic();
    let mut touched = BTreeSet::new();
    for &column in columns {
        let row_indices = symbolic.row_idx_of_col_raw(column);
        for (&row, value) in row_indices.iter().zip(jacobian.val_of_col(column)) {
            if *value != 0.0 {
                touched.insert(row);
            }
        }
    }

    let position: BTreeMap<usize, usize> = touched.iter().enumerate().map(|(i, &row)| (row, i)).collect();
    let mut rows = DMatrix::zeros(touched.len(), jacobian.ncols());
    for column in 0..jacobian.ncols() {
        let row_indices = symbolic.row_idx_of_col_raw(column);
        for (row, value) in row_indices.iter().zip(jacobian.val_of_col(column)) {
            if let Some(&i) = position.get(row) {
                rows[(i, column)] += *value;
            }
        }
    }
    (touched.into_iter().collect(), rows)
}

/// Schur elimination of `elim` from the quadratic `(h, g, c)`.
fn eliminate(
    h: &DMatrix<f64>,
    g: &DVector<f64>,
    c: f64,
    keep: &[usize],
    elim: &[usize],
) -> Result<(DMatrix<f64>, DVector<f64>, f64), MarginalizationError> {
    let (factor, rank) = inverse_sqrt_factor(&block(h, elim, elim));
    if rank < elim.len() {
        debug!(
            "Eliminated block has rank {rank} of {}, using pseudo-inverse",
            elim.len()
        );
    }

    let w = block(h, keep, elim) * &factor;
    let u = factor.tr_mul(&subvector(g, elim));
    let mut lhs = block(h, keep, keep) - &w * w.transpose();
    let rhs = subvector(g, keep) - &w * &u;
    let offset = c - u.norm_squared();

    if !lhs.is_empty() {
        let asymmetry = max_asymmetry(&lhs);
        if asymmetry > ASYMMETRY_TOLERANCE * (1.0 + h.abs().max()) {
            return Err(MarginalizationError::AsymmetricPrior(asymmetry));
        }
        symmetrize(&mut lhs);
    }
    Ok((lhs, rhs, offset))
}

/// `V·Λ^{-1/2}` over the eigenpairs of a symmetric matrix above the cutoff, with their count
fn inverse_sqrt_factor(matrix: &DMatrix<f64>) -> (DMatrix<f64>, usize) {
    if matrix.is_empty() {
        return (DMatrix::zeros(matrix.nrows(), 0), 0);
    }
    let eigen = SymmetricEigen::new(matrix.clone());
    let cutoff = EIGENVALUE_CUTOFF * largest_magnitude(&eigen.eigenvalues);
    let kept: Vec<usize> = (0..eigen.eigenvalues.len())
        .filter(|&i| eigen.eigenvalues[i] > cutoff && eigen.eigenvalues[i] > 0.0)
        .collect();
    let mut factor = DMatrix::zeros(matrix.nrows(), kept.len());
    for (k, &i) in kept.iter().enumerate() {
        factor.set_column(k, &(eigen.eigenvectors.column(i) / eigen.eigenvalues[i].sqrt()));
    }
    (factor, kept.len())
}

fn largest_magnitude(values: &DVector<f64>) -> f64 {
    values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}

struct Projection {
    lhs: DMatrix<f64>,
    rhs: DVector<f64>,
    minimizer: DVector<f64>,
    minimum: f64,
    clamped: usize,
}

/// Nearest positive semi-definite quadratic to `(lhs, rhs, offset)` in the
/// eigenbasis of `lhs`, bounded below by zero.
fn project_psd(lhs: DMatrix<f64>, rhs: &DVector<f64>, offset: f64) -> Projection {
    let n = lhs.nrows();
    if n == 0 {
        return Projection {
            lhs,
            rhs: DVector::zeros(0),
            minimizer: DVector::zeros(0),
            minimum: offset.max(0.0),
            clamped: 0,
        };
    }

    let eigen = SymmetricEigen::new(lhs);
    let cutoff = EIGENVALUE_CUTOFF * largest_magnitude(&eigen.eigenvalues);
    let mut values = DVector::<f64>::zeros(n);
    let mut projected = DVector::<f64>::zeros(n);
    let mut minimizer = DVector::<f64>::zeros(n);
    let mut explained = 0.0;
    let mut clamped = 0;
    for (i, &value) in eigen.eigenvalues.iter().enumerate() {
        if value <= cutoff || value <= 0.0 {
            clamped += 1;
            continue;
        }
        let direction = eigen.eigenvectors.column(i).clone_owned();
        let p = direction.dot(rhs);
        values[i] = value;
        projected += &direction * p;
        minimizer += &direction * (p / value);
        explained += p * p / value;
    }

    let vectors = &eigen.eigenvectors;
    let mut lhs = vectors * DMatrix::from_diagonal(&values) * vectors.transpose();
    symmetrize(&mut lhs);
    Projection {
        lhs,
        rhs: projected,
        minimizer,
        minimum: (offset - explained).max(0.0),
        clamped,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use faer::sparse::{SparseColMat, Triplet};

    const TOL: f64 = 1e-9;

    fn to_sparse(dense: &DMatrix<f64>) -> SparseMatrix {
        let mut triplets = Vec::new();
        for col in 0..dense.ncols() {
            for row in 0..dense.nrows() {
                if dense[(row, col)] != 0.0 {
                    triplets.push(Triplet::new(row, col, dense[(row, col)]));
                }
            }
        }
        SparseColMat::try_new_from_triplets(dense.nrows(), dense.ncols(), &triplets).unwrap()
    }

    /// `uuid(ids[i]) -> i`
    fn layout(ids: &[u64]) -> HashMap<Uuid, usize> {
        ids.iter().enumerate().map(|(i, &id)| (Uuid(id), i)).collect()
    }

    fn scenario_b() -> (DMatrix<f64>, DVector<f64>) {
        let g = DMatrix::from_fn(10, 5, |i, j| {
            (1.0 + 0.7 * i as f64 + 1.3 * j as f64).sin() + if i == j { 1.0 } else { 0.0 }
        });
        let y = DVector::from_fn(10, |i, _| (0.5 * i as f64).cos());
        (g, y)
    }

    /// Chain-structured design: rows 0-3 touch {0, 1}, rows 4-7 {1, 2}, rows 8-9 {2, 3}.
    fn chain() -> (DMatrix<f64>, DVector<f64>) {
        let j = DMatrix::from_fn(10, 4, |i, k| {
            let first = match i {
                0..=3 => 0,
                4..=7 => 1,
                _ => 2,
            };
            if k == first || k == first + 1 {
                1.0 + 0.3 * i as f64 - 0.4 * k as f64 + if k == first { 0.5 } else { 0.0 }
            } else {
                0.0
            }
        });
        let y = DVector::from_fn(10, |i, _| (0.5 * i as f64).cos());
        (j, y)
    }

    fn least_squares(j: &DMatrix<f64>, y: &DVector<f64>) -> DVector<f64> {
        solve_symm(&j.tr_mul(j), &j.tr_mul(y), 0.0, 0.0).unwrap()
    }

    fn empty_jacobian(ncols: usize) -> SparseMatrix {
        SparseColMat::try_new_from_triplets(0, ncols, &[]).unwrap()
    }

    #[test]
    fn test_elimination_reproduces_joint_solution() {
        let (g, y) = scenario_b();
        let exact = least_squares(&g, &y);
        let expected = [
            0.4199471693638676,
            -0.45761097748554186,
            -0.5694547331873167,
            -0.20922209363478186,
            -0.04315671002008435,
        ];
        for (value, expected) in exact.iter().zip(expected) {
            assert!((value - expected).abs() < TOL);
        }

        // The linearization point does not matter for a linear problem.
        for x0 in [exact.clone(), DVector::from_element(5, 0.3)] {
            let mut bias = MarginalizingBias::new(DampingConfig::none());
            bias.update_indices(&layout(&[0, 1, 2, 3, 4])).unwrap();
            let residual = &y - &g * &x0;
            bias.marginalize(&to_sparse(&g), &residual, &x0, &[0, 1, 4], &[2, 3])
                .unwrap();
            assert_eq!(bias.ids(), &[Uuid(0), Uuid(1), Uuid(4)]);
            assert_eq!(max_asymmetry(bias.lhs()), 0.0);

            bias.update_indices(&layout(&[0, 1, 4])).unwrap();
            let x0_kept = subvector(&x0, &[0, 1, 4]);
            let dx = bias
                .solve(&empty_jacobian(3), &x0_kept, &DVector::zeros(0))
                .unwrap();
            let solved = &x0_kept + dx;
            for (k, &i) in [0, 1, 4].iter().enumerate() {
                assert!((solved[k] - exact[i]).abs() < TOL);
            }

            // At the optimum the prior equals the summarized squared residual.
            let ssq = (&y - &g * &exact).norm_squared();
            let at_exact = bias.bias(&subvector(&exact, &[0, 1, 4])).unwrap();
            assert!((at_exact - ssq).abs() < TOL);
            assert!(bias.bias(&DVector::zeros(3)).unwrap() > at_exact);
        }
    }

    #[test]
    fn test_sequential_elimination_matches_joint() {
        let (g, y) = scenario_b();
        let x0 = DVector::from_element(5, 0.1);
        let residual = &y - &g * &x0;

        let mut sequential = MarginalizingBias::new(DampingConfig::none());
        sequential.update_indices(&layout(&[0, 1, 2, 3, 4])).unwrap();
        sequential
            .marginalize(&to_sparse(&g), &residual, &x0, &[0, 1, 4], &[2, 3])
            .unwrap();
        sequential.update_indices(&layout(&[0, 1, 4])).unwrap();
        let x0_kept = subvector(&x0, &[0, 1, 4]);
        sequential
            .marginalize(&empty_jacobian(3), &DVector::zeros(0), &x0_kept, &[2], &[0, 1])
            .unwrap();
        sequential.update_indices(&layout(&[4])).unwrap();

        let mut joint = MarginalizingBias::new(DampingConfig::none());
        joint.update_indices(&layout(&[0, 1, 2, 3, 4])).unwrap();
        joint
            .marginalize(&to_sparse(&g), &residual, &x0, &[4], &[0, 1, 2, 3])
            .unwrap();
        joint.update_indices(&layout(&[4])).unwrap();

        let start = DVector::from_element(1, 0.1);
        let x_sequential = &start
            + sequential
                .solve(&empty_jacobian(1), &start, &DVector::zeros(0))
                .unwrap();
        let x_joint = &start
            + joint
                .solve(&empty_jacobian(1), &start, &DVector::zeros(0))
                .unwrap();
        assert!((x_sequential[0] - x_joint[0]).abs() < TOL);
        assert!((x_joint[0] - (-0.04315671002008435)).abs() < TOL);
        assert!((sequential.offset() - joint.offset()).abs() < TOL);
    }

    #[test]
    fn test_rows_touching_eliminated_variables_are_skipped() {
        let (j, y) = chain();
        let exact = least_squares(&j, &y);
        let x0 = DVector::zeros(4);
        let jacobian = to_sparse(&j);

        let mut bias = MarginalizingBias::new(DampingConfig::none());
        bias.update_indices(&layout(&[0, 1, 2, 3])).unwrap();
        bias.marginalize(&jacobian, &y, &x0, &[1], &[0]).unwrap();
        // Rows 0-3 were consumed by the first elimination.
        bias.marginalize(&jacobian, &y, &x0, &[2], &[1]).unwrap();
        assert_eq!(bias.ids(), &[Uuid(2)]);
        assert!(bias.is_eliminated(Uuid(0)) && bias.is_eliminated(Uuid(1)));

        bias.update_indices(&layout(&[2, 3])).unwrap();
        let remaining = j.view((8, 2), (2, 2)).into_owned();
        let dx = bias
            .solve(&to_sparse(&remaining), &DVector::zeros(2), &y.rows(8, 2).into_owned())
            .unwrap();
        assert!((dx[0] - exact[2]).abs() < TOL);
        assert!((dx[1] - exact[3]).abs() < TOL);
    }

    #[test]
    fn test_open_markov_blanket_rejected() {
        let (j, y) = chain();
        let mut bias = MarginalizingBias::new(DampingConfig::none());
        bias.update_indices(&layout(&[0, 1, 2, 3])).unwrap();
        let result = bias.marginalize(&to_sparse(&j), &y, &DVector::zeros(4), &[0], &[1]);
        assert!(matches!(
            result,
            Err(MarginalizationError::OpenMarkovBlanket { column: 2, .. })
        ));
        assert!(bias.is_empty());
    }

    #[test]
    fn test_layout_validation() {
        let (g, y) = scenario_b();
        let mut bias = MarginalizingBias::new(DampingConfig::none());
        bias.update_indices(&layout(&[0, 1, 2])).unwrap();
        assert!(matches!(
            bias.marginalize(&to_sparse(&g), &y, &DVector::zeros(5), &[0], &[1]),
            Err(MarginalizationError::LayoutMismatch { expected: 3, actual: 5 })
        ));

        let duplicated: HashMap<Uuid, usize> = [(Uuid(0), 0), (Uuid(1), 0)].into_iter().collect();
        assert!(matches!(
            bias.update_indices(&duplicated),
            Err(MarginalizationError::InvalidLayout(_))
        ));

        bias.update_indices(&layout(&[0, 1, 2, 3, 4])).unwrap();
        bias.marginalize(&to_sparse(&g), &y, &DVector::zeros(5), &[0, 1, 4], &[2, 3])
            .unwrap();
        assert!(matches!(
            bias.update_indices(&layout(&[0, 1, 2, 4])),
            Err(MarginalizationError::ReintroducedVariable(Uuid(2)))
        ));
    }

    #[test]
    fn test_absent_variables_are_pruned_from_prior() {
        let (g, y) = scenario_b();
        let exact = least_squares(&g, &y);
        let mut bias = MarginalizingBias::new(DampingConfig::none());
        bias.update_indices(&layout(&[0, 1, 2, 3, 4])).unwrap();
        bias.marginalize(&to_sparse(&g), &y, &DVector::zeros(5), &[0, 1, 4], &[2, 3])
            .unwrap();
        assert!(bias.contains(Uuid(4)));

        bias.update_indices(&layout(&[0, 1])).unwrap();
        assert_eq!(bias.len(), 2);
        assert!(!bias.contains(Uuid(4)));
        assert!(bias.is_eliminated(Uuid(4)));

        let dx = bias
            .solve(&empty_jacobian(2), &DVector::zeros(2), &DVector::zeros(0))
            .unwrap();
        assert!((dx[0] - exact[0]).abs() < TOL);
        assert!((dx[1] - exact[1]).abs() < TOL);
    }

    #[test]
    fn test_rank_deficient_block_uses_pseudo_inverse() {
        // Two columns that only ever appear as their difference.
        let j = DMatrix::from_row_slice(3, 3, &[1.0, -1.0, 0.5, 2.0, -2.0, 1.0, 0.0, 0.0, 1.0]);
        let y = DVector::from_vec(vec![0.2, -0.1, 0.4]);
        let mut bias = MarginalizingBias::new(DampingConfig::none());
        bias.update_indices(&layout(&[0, 1, 2])).unwrap();
        bias.marginalize(&to_sparse(&j), &y, &DVector::zeros(3), &[2], &[0, 1])
            .unwrap();
        assert_eq!(bias.len(), 1);
        assert!(bias.lhs()[(0, 0)].is_finite());
        assert!(bias.offset() >= -TOL);
    }

    #[test]
    fn test_indefinite_reduction_is_clamped() {
        let lhs = DMatrix::from_diagonal(&DVector::from_vec(vec![2.0, -1e-6]));
        let rhs = DVector::from_vec(vec![2.0, 3.0]);
        let projection = project_psd(lhs, &rhs, 0.5);
        assert_eq!(projection.clamped, 1);
        assert!((projection.lhs[(0, 0)] - 2.0).abs() < TOL);
        assert!(projection.lhs[(1, 1)].abs() < TOL);
        assert!((projection.rhs[0] - 2.0).abs() < TOL);
        assert!(projection.rhs[1].abs() < TOL);
        assert!((projection.minimizer[0] - 1.0).abs() < TOL);
        // c − rᵀL⁺r is negative here, which no sum of squares can produce.
        assert_eq!(projection.minimum, 0.0);
    }

    #[test]
    fn test_near_singular_elimination_stays_bounded_below() {
        // The eliminated column is almost a copy of the kept one, so H_bb and
        // H_kb·H_bb⁻¹·H_bk nearly cancel H_kk.
        let j = DMatrix::from_row_slice(
            4,
            2,
            &[1.0, 1.0 + 1e-9, 2.0, 2.0 - 1e-9, -1.0, -1.0, 0.5, 0.5 + 2e-9],
        );
        let y = DVector::from_vec(vec![0.3, -0.2, 0.1, 0.4]);
        let x0 = DVector::from_vec(vec![1e3, -1e3]);
        let residual = &y - &j * &x0;

        let mut bias = MarginalizingBias::new(DampingConfig::none());
        bias.update_indices(&layout(&[0, 1])).unwrap();
        bias.marginalize(&to_sparse(&j), &residual, &x0, &[0], &[1]).unwrap();
        bias.update_indices(&layout(&[0])).unwrap();

        assert!(bias.lhs()[(0, 0)] >= 0.0);
        assert!(bias.minimum() >= 0.0);
        for value in [-1e4, -1.0, 0.0, 1e-3, 1e3, 1e6] {
            assert!(bias.bias(&DVector::from_element(1, value)).unwrap() >= 0.0);
        }
    }

    #[test]
    fn test_damped_solve_reports_singular_system() {
        let mut bias = MarginalizingBias::new(DampingConfig::none());
        bias.update_indices(&layout(&[0, 1])).unwrap();
        let j = to_sparse(&DMatrix::from_row_slice(1, 2, &[1.0, 1.0]));
        let result = bias.solve(&j, &DVector::zeros(2), &DVector::zeros(1));
        assert!(matches!(result, Err(MarginalizationError::LinearAlgebra(_))));

        let damped = MarginalizingBias {
            damping: DampingConfig::default(),
            ..bias
        };
        assert!(damped.solve(&j, &DVector::zeros(2), &DVector::zeros(1)).is_ok());
    }
}
