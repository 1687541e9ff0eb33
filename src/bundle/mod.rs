//! # Normal-equation builder
//!
//! [`GlobalBundle`] turns the current window (observations plus the camera and
//! point ledgers) into a sparse least-squares problem:
//!
//! - **rows**: two per surviving observation, ordered by camera time, point id,
//!   then pixel coordinate (u, v). Dropped observations and observations touching a
//!   marginalized camera or point do not survive.
//! - **columns**: 3 per non-marginalized point (in id order), followed by 6 per
//!   non-marginalized camera (in time order).
//!
//! Every column is named by a registry [`Uuid`]; the resulting `uuid -> column`
//! map ([`GlobalBundle::predictor_uuids`]) is what the marginalization prior is
//! re-based onto after each rebuild.
//!
//! Residuals are `observed - projected` at the current values. Jacobian blocks of
//! linearized cameras and points are evaluated at their frozen copies, so the
//! blocks that entered the prior stay consistent with the ones used for solving.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector, Matrix2x3, SMatrix, Vector3, Vector6};
use thiserror::Error;
use tracing::debug;

use crate::camera::{CameraModelError, numerical_jacobian};
use crate::config::{BundleConfig, JacobianMode};
use crate::core::frames::{CameraFrame, CameraTime, ObservationSet, PointId, PointObservation, ReconstructedPoint};
use crate::core::ledger::{LifecycleState, MarginalizedMap};
use crate::core::registry::{
    CAMERA_DOF, POINT_DOF, RegistryError, Uuid, Variable, VariableKey, VariableRegistry,
};
use crate::linalg::{LinAlgError, SparseMatrix, sparse_to_dense};

/// Builder specific error types
#[derive(Debug, Clone, Error)]
pub enum BundleError {
    #[error("No camera frame for observations at time {0}")]
    MissingCamera(CameraTime),
    #[error("Non-marginalized camera at time {0} has no surviving observations")]
    CameraWithoutObservations(CameraTime),
    #[error("Point {point} has {count} surviving observations, at least {required} required")]
    InsufficientObservations {
        point: PointId,
        count: usize,
        required: usize,
    },
    #[error("Jacobian column {column} ({key}, {uuid}) is entirely zero")]
    ZeroJacobianColumn {
        column: usize,
        uuid: Uuid,
        key: VariableKey,
    },
    #[error("No frozen copy of linearized {0}")]
    MissingFrozenCopy(String),
    #[error("Variable {0} is not part of this bundle")]
    UnknownVariable(VariableKey),
    #[error("Projection of point {point} at time {time} failed: {source}")]
    Projection {
        time: CameraTime,
        point: PointId,
        source: CameraModelError,
    },
    #[error("Expected {expected} unknowns, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Jacobian has not been computed, call copy_in first")]
    NotLinearized,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// Read-only view of the window state consumed by the builder
#[derive(Debug, Clone, Copy)]
pub struct BundleInputs<'a> {
    pub observations: &'a ObservationSet,
    pub cameras: &'a MarginalizedMap<CameraTime, CameraFrame>,
    pub points: &'a MarginalizedMap<PointId, ReconstructedPoint>,
    pub frozen_cameras: &'a BTreeMap<CameraTime, CameraFrame>,
    pub frozen_points: &'a BTreeMap<PointId, ReconstructedPoint>,
    pub dropped: &'a BTreeSet<PointObservation>,
}

impl<'a> BundleInputs<'a> {
    /// Current record and linearization record (frozen copy if linearized)
    fn camera(&self, time: CameraTime) -> Result<(&'a CameraFrame, &'a CameraFrame), BundleError> {
        let entry = self
            .cameras
            .entry(&time)
            .ok_or(BundleError::MissingCamera(time))?;
        let frozen = match entry.state {
            LifecycleState::Linearized => self
                .frozen_cameras
                .get(&time)
                .ok_or_else(|| BundleError::MissingFrozenCopy(format!("camera at time {time}")))?,
            _ => entry.value,
        };
        Ok((entry.value, frozen))
    }

    fn point(&self, id: PointId) -> Result<(&'a ReconstructedPoint, &'a ReconstructedPoint), BundleError> {
        let entry = self
            .points
            .entry(&id)
            .ok_or(BundleError::UnknownVariable(VariableKey::point(id, 0)))?;
        let frozen = match entry.state {
            LifecycleState::Linearized => self
                .frozen_points
                .get(&id)
                .ok_or_else(|| BundleError::MissingFrozenCopy(format!("point {id}")))?,
            _ => entry.value,
        };
        Ok((entry.value, frozen))
    }
}

fn is_unknown(state: Option<LifecycleState>) -> bool {
    matches!(
        state,
        Some(LifecycleState::Active | LifecycleState::Linearized)
    )
}

/// Sparse observation Jacobian and residual of the current window
#[derive(Debug, Clone)]
pub struct GlobalBundle {
    config: BundleConfig,
    /// One entry per surviving observation; rows `2i` and `2i + 1`
    observations: Vec<PointObservation>,
    columns: Vec<Variable>,
    column_of: HashMap<VariableKey, usize>,
    predictor_uuids: HashMap<Uuid, usize>,
    point_offsets: BTreeMap<PointId, usize>,
    camera_offsets: BTreeMap<CameraTime, usize>,
    observed: DVector<f64>,
    x: DVector<f64>,
    linearization_point: DVector<f64>,
    residual: DVector<f64>,
    jacobian: Option<SparseMatrix>,
}

impl GlobalBundle {
    /// Enumerate rows and columns of the current keep-set and register every column.
    pub fn new(
        config: &BundleConfig,
        inputs: &BundleInputs<'_>,
        registry: &mut VariableRegistry,
    ) -> Result<Self, BundleError> {
        config.intrinsics.validate()?;

        let mut observations = Vec::new();
        let mut observed_pixels = Vec::new();
        let mut camera_counts: BTreeMap<CameraTime, usize> = BTreeMap::new();
        let mut point_counts: BTreeMap<PointId, usize> = BTreeMap::new();

        for (time, frame) in inputs.observations.frames() {
            match inputs.cameras.state(time) {
                None if config.skip_missing_cameras => continue,
                None => return Err(BundleError::MissingCamera(*time)),
                Some(LifecycleState::Marginalized) => continue,
                Some(_) => {}
            }
            for (point, pixel) in frame {
                let observation = PointObservation::new(*time, *point);
                if inputs.dropped.contains(&observation) || !is_unknown(inputs.points.state(point)) {
                    continue;
                }
                observations.push(observation);
                observed_pixels.push(*pixel);
                *camera_counts.entry(*time).or_default() += 1;
                *point_counts.entry(*point).or_default() += 1;
            }
        }

        for time in inputs.cameras.unmarginalized_keys() {
            if !camera_counts.contains_key(&time) {
                return Err(BundleError::CameraWithoutObservations(time));
            }
        }
        let required = config.min_point_observations.max(1);
        for point in inputs.points.unmarginalized_keys() {
            let count = point_counts.get(&point).copied().unwrap_or(0);
            if count < required {
                return Err(BundleError::InsufficientObservations {
                    point,
                    count,
                    required,
                });
            }
        }

        let mut bundle = Self {
            config: config.clone(),
            observations,
            columns: Vec::new(),
            column_of: HashMap::new(),
            predictor_uuids: HashMap::new(),
            point_offsets: BTreeMap::new(),
            camera_offsets: BTreeMap::new(),
            observed: DVector::from_iterator(
                2 * observed_pixels.len(),
                observed_pixels.iter().flat_map(|pixel| [pixel.x, pixel.y]),
            ),
            x: DVector::zeros(0),
            linearization_point: DVector::zeros(0),
            residual: DVector::zeros(0),
            jacobian: None,
        };

        let mut current = Vec::new();
        let mut frozen = Vec::new();
        for point in inputs.points.unmarginalized_keys() {
            let (value, linearized) = inputs.point(point)?;
            bundle.point_offsets.insert(point, bundle.columns.len());
            for dim in 0..POINT_DOF {
                bundle.register(VariableKey::point(point, dim), registry)?;
                current.push(value.position[dim]);
                frozen.push(linearized.position[dim]);
            }
        }
        for time in inputs.cameras.unmarginalized_keys() {
            let (value, linearized) = inputs.camera(time)?;
            bundle.camera_offsets.insert(time, bundle.columns.len());
            for dim in 0..CAMERA_DOF {
                bundle.register(VariableKey::camera(time, dim), registry)?;
                current.push(value.kep()[dim]);
                frozen.push(linearized.kep()[dim]);
            }
        }
        bundle.x = DVector::from_vec(current);
        bundle.linearization_point = DVector::from_vec(frozen);

        debug!(
            "Global bundle: {} observations, {} points, {} cameras, {} unknowns",
            bundle.observations.len(),
            bundle.point_offsets.len(),
            bundle.camera_offsets.len(),
            bundle.columns.len()
        );
        Ok(bundle)
    }

    fn register(&mut self, key: VariableKey, registry: &mut VariableRegistry) -> Result<(), BundleError> {
        let uuid = registry.generate(key)?;
        let column = self.columns.len();
        self.columns.push(Variable { uuid, key });
        self.column_of.insert(key, column);
        self.predictor_uuids.insert(uuid, column);
        Ok(())
    }

    /// Evaluate residuals and Jacobian blocks for every surviving observation.
    pub fn copy_in(&mut self, inputs: &BundleInputs<'_>) -> Result<(), BundleError> {
        let intrinsics = self.config.intrinsics;
        let step = self.config.numerical_step;
        let nrows = 2 * self.observations.len();
        let ncols = self.columns.len();

        let mut residual = DVector::zeros(nrows);
        let mut x = DVector::zeros(ncols);
        let mut triplets = Vec::with_capacity(nrows * (POINT_DOF + CAMERA_DOF));
        let mut column_norms = vec![0.0; ncols];

        for (i, observation) in self.observations.iter().enumerate() {
            let (time, point) = (observation.time, observation.point);
            let projection_error = |source| BundleError::Projection { time, point, source };

            let (camera, frozen_camera) = inputs.camera(time)?;
            let (record, frozen_record) = inputs.point(point)?;
            let point_col = self.point_offset(point)?;
            let camera_col = self.camera_offset(time)?;

            let projected = intrinsics
                .project(camera, &record.position)
                .map_err(projection_error)?;
            residual[2 * i] = self.observed[2 * i] - projected.x;
            residual[2 * i + 1] = self.observed[2 * i + 1] - projected.y;

            let d_point: Matrix2x3<f64> = match self.config.point_jacobian {
                JacobianMode::Analytic => intrinsics.jacobian_point(frozen_camera, &frozen_record.position),
                JacobianMode::Numerical(scheme) => numerical_jacobian(
                    |p: &Vector3<f64>| intrinsics.project(frozen_camera, p),
                    &frozen_record.position,
                    scheme,
                    step,
                ),
            }
            .map_err(projection_error)?;
            let d_camera: SMatrix<f64, 2, 6> = match self.config.camera_jacobian {
                JacobianMode::Analytic => intrinsics.jacobian_kep(frozen_camera, &frozen_record.position),
                JacobianMode::Numerical(scheme) => numerical_jacobian(
                    |kep: &Vector6<f64>| intrinsics.project_kep(kep, &frozen_record.position),
                    frozen_camera.kep(),
                    scheme,
                    step,
                ),
            }
            .map_err(projection_error)?;

            for r in 0..2 {
                let row = 2 * i + r;
                for c in 0..POINT_DOF {
                    push_entry(&mut triplets, &mut column_norms, row, point_col + c, d_point[(r, c)]);
                }
                for c in 0..CAMERA_DOF {
                    push_entry(&mut triplets, &mut column_norms, row, camera_col + c, d_camera[(r, c)]);
                }
            }

            for dim in 0..POINT_DOF {
                x[point_col + dim] = record.position[dim];
            }
            for dim in 0..CAMERA_DOF {
                x[camera_col + dim] = camera.kep()[dim];
            }
        }

        if let Some(column) = column_norms.iter().position(|norm| *norm == 0.0) {
            let variable = self.columns[column];
            return Err(BundleError::ZeroJacobianColumn {
                column,
                uuid: variable.uuid,
                key: variable.key,
            });
        }

        let jacobian = SparseColMat::try_new_from_triplets(nrows, ncols, &triplets)
            .map_err(|e| LinAlgError::SparseMatrixCreation(format!("Jacobian: {e:?}")))?;

        self.residual = residual;
        self.x = x;
        self.jacobian = Some(jacobian);
        Ok(())
    }

    /// Write `x` back into every non-marginalized camera and point record.
    pub fn copy_out(
        &self,
        x: &DVector<f64>,
        cameras: &mut MarginalizedMap<CameraTime, CameraFrame>,
        points: &mut MarginalizedMap<PointId, ReconstructedPoint>,
    ) -> Result<(), BundleError> {
        if x.len() != self.columns.len() {
            return Err(BundleError::DimensionMismatch {
                expected: self.columns.len(),
                actual: x.len(),
            });
        }
        for (point, offset) in &self.point_offsets {
            if !is_unknown(points.state(point)) {
                continue;
            }
            if let Some(record) = points.get_mut(point) {
                record.position = Vector3::new(x[*offset], x[offset + 1], x[offset + 2]);
            }
        }
        for (time, offset) in &self.camera_offsets {
            if !is_unknown(cameras.state(time)) {
                continue;
            }
            if let Some(frame) = cameras.get_mut(time) {
                frame.set_kep(Vector6::from_fn(|dim, _| x[offset + dim]));
            }
        }
        Ok(())
    }

    /// Sum of squared pixel residuals per observation
    pub fn sum_squared_observation_residuals(&self) -> BTreeMap<PointObservation, f64> {
        let mut result = BTreeMap::new();
        if self.residual.len() != 2 * self.observations.len() {
            return result;
        }
        for (i, observation) in self.observations.iter().enumerate() {
            *result.entry(*observation).or_insert(0.0) +=
                self.residual[2 * i].powi(2) + self.residual[2 * i + 1].powi(2);
        }
        result
    }

    pub fn jacobian(&self) -> Result<&SparseMatrix, BundleError> {
        self.jacobian.as_ref().ok_or(BundleError::NotLinearized)
    }

    pub fn jacobian_dense(&self) -> Result<DMatrix<f64>, BundleError> {
        Ok(sparse_to_dense(self.jacobian()?))
    }

    /// `observed - projected`, valid after [`Self::copy_in`]
    pub fn residual(&self) -> &DVector<f64> {
        &self.residual
    }

    /// Current unknown values
    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    /// Unknown values with linearized variables replaced by their frozen copies
    pub fn linearization_point(&self) -> &DVector<f64> {
        &self.linearization_point
    }

    pub fn predictor_uuids(&self) -> &HashMap<Uuid, usize> {
        &self.predictor_uuids
    }

    pub fn variables(&self) -> &[Variable] {
        &self.columns
    }

    pub fn observations(&self) -> &[PointObservation] {
        &self.observations
    }

    pub fn column_of(&self, key: &VariableKey) -> Result<usize, BundleError> {
        self.column_of
            .get(key)
            .copied()
            .ok_or(BundleError::UnknownVariable(*key))
    }

    pub fn point_columns(&self, point: PointId) -> Result<Range<usize>, BundleError> {
        let offset = self.point_offset(point)?;
        Ok(offset..offset + POINT_DOF)
    }

    pub fn camera_columns(&self, time: CameraTime) -> Result<Range<usize>, BundleError> {
        let offset = self.camera_offset(time)?;
        Ok(offset..offset + CAMERA_DOF)
    }

    fn point_offset(&self, point: PointId) -> Result<usize, BundleError> {
        self.point_offsets
            .get(&point)
            .copied()
            .ok_or(BundleError::UnknownVariable(VariableKey::point(point, 0)))
    }

    fn camera_offset(&self, time: CameraTime) -> Result<usize, BundleError> {
        self.camera_offsets
            .get(&time)
            .copied()
            .ok_or(BundleError::UnknownVariable(VariableKey::camera(time, 0)))
    }

    pub fn num_rows(&self) -> usize {
        2 * self.observations.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

fn push_entry(
    triplets: &mut Vec<Triplet<usize, usize, f64>>,
    column_norms: &mut [f64],
    row: usize,
    col: usize,
    value: f64,
) {
    if value != 0.0 {
        triplets.push(Triplet::new(row, col, value));
        column_norms[col] += value.abs();
    }
}
