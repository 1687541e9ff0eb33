//! Mutable state of one sliding-window reconstruction
//!
//! [`WindowState`] owns everything the scheduler and the normal-equation builder
//! operate on: the observation map, both lifecycle ledgers, the frozen copies taken
//! at linearization time, the drop-set and the variable registry.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector2;

use crate::bundle::BundleInputs;
use crate::core::frames::{
    CameraFrame, CameraTime, FrameError, ObservationSet, PointId, PointObservation,
    ReconstructedPoint,
};
use crate::core::ledger::{LedgerError, LifecycleState, MarginalizedMap};
use crate::core::registry::VariableRegistry;

#[derive(Debug, Clone, Default)]
pub struct WindowState {
    pub observations: ObservationSet,
    pub cameras: MarginalizedMap<CameraTime, CameraFrame>,
    pub points: MarginalizedMap<PointId, ReconstructedPoint>,
    pub frozen_cameras: BTreeMap<CameraTime, CameraFrame>,
    pub frozen_points: BTreeMap<PointId, ReconstructedPoint>,
    /// Observations excluded from both the Jacobian and the prior
    pub dropped: BTreeSet<PointObservation>,
    /// Points flagged by the tracker, with the time they were flagged
    pub bad_points: BTreeMap<PointId, CameraTime>,
    pub registry: VariableRegistry,
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_camera(&mut self, time: CameraTime, frame: CameraFrame) -> Result<(), LedgerError> {
        self.cameras.insert(time, frame)
    }

    pub fn add_point(&mut self, id: PointId, point: ReconstructedPoint) -> Result<(), LedgerError> {
        self.points.insert(id, point)
    }

    pub fn add_observation(
        &mut self,
        time: CameraTime,
        point: PointId,
        pixel: Vector2<f64>,
    ) -> Result<(), FrameError> {
        self.observations.insert(time, point, pixel)?;
        if let Some(record) = self.points.get_mut(&point) {
            record.first_seen = Some(record.first_seen.map_or(time, |first| first.min(time)));
        }
        Ok(())
    }

    pub fn flag_bad_point(&mut self, point: PointId, time: CameraTime) {
        self.bad_points.insert(point, time);
    }

    /// Freeze the camera's current pose and move it to the linearized partition.
    pub fn linearize_camera(&mut self, time: CameraTime) -> Result<(), LedgerError> {
        self.cameras.move_to_linearized(&time)?;
        if let Some(frame) = self.cameras.get(&time) {
            self.frozen_cameras.insert(time, frame.clone());
        }
        Ok(())
    }

    /// Linearize the camera unless it already is.
    pub fn ensure_camera_linearized(&mut self, time: CameraTime) -> Result<(), LedgerError> {
        match self.cameras.state(&time) {
            Some(LifecycleState::Linearized) => Ok(()),
            _ => self.linearize_camera(time),
        }
    }

    pub fn linearize_point(&mut self, id: PointId) -> Result<(), LedgerError> {
        self.points.move_to_linearized(&id)?;
        if let Some(point) = self.points.get(&id) {
            self.frozen_points.insert(id, point.clone());
        }
        Ok(())
    }

    pub fn ensure_point_linearized(&mut self, id: PointId) -> Result<(), LedgerError> {
        match self.points.state(&id) {
            Some(LifecycleState::Linearized) => Ok(()),
            _ => self.linearize_point(id),
        }
    }

    /// Frozen copies are kept after marginalization for bias bookkeeping.
    pub fn marginalize_camera(&mut self, time: CameraTime) -> Result<(), LedgerError> {
        self.cameras.move_to_marginalized(&time)
    }

    pub fn marginalize_point(&mut self, id: PointId) -> Result<(), LedgerError> {
        self.points.move_to_marginalized(&id)
    }

    pub fn drop_observation(&mut self, observation: PointObservation) -> bool {
        self.dropped.insert(observation)
    }

    /// True if the observation still produces Jacobian rows: not dropped, and both
    /// its camera and its point exist and are not marginalized.
    pub fn is_observation_alive(&self, observation: &PointObservation) -> bool {
        !self.dropped.contains(observation)
            && is_unknown(self.cameras.state(&observation.time))
            && is_unknown(self.points.state(&observation.point))
    }

    /// Non-marginalized cameras observing `point` through a surviving observation
    pub fn live_observers(&self, point: PointId) -> Vec<CameraTime> {
        self.observations
            .observers(point)
            .filter(|time| self.is_observation_alive(&PointObservation::new(*time, point)))
            .collect()
    }

    /// Points whose observation at `time` is still alive
    pub fn live_points_at(&self, time: CameraTime) -> Vec<PointId> {
        self.observations
            .frame(time)
            .into_iter()
            .flat_map(|frame| frame.keys())
            .copied()
            .filter(|point| self.is_observation_alive(&PointObservation::new(time, *point)))
            .collect()
    }

    /// Split into the read-only builder inputs and the mutable registry.
    pub fn bundle_inputs(&mut self) -> (BundleInputs<'_>, &mut VariableRegistry) {
        let WindowState {
            observations,
            cameras,
            points,
            frozen_cameras,
            frozen_points,
            dropped,
            registry,
            ..
        } = self;
        (
            BundleInputs {
                observations,
                cameras,
                points,
                frozen_cameras,
                frozen_points,
                dropped,
            },
            registry,
        )
    }
}

fn is_unknown(state: Option<LifecycleState>) -> bool {
    matches!(
        state,
        Some(LifecycleState::Active | LifecycleState::Linearized)
    )
}
