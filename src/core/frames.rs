//! Camera, point and observation records exchanged with the reconstruction front-end

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Rotation3, Vector2, Vector3, Vector6};
use thiserror::Error;

use crate::camera::{kep_from_rotation, pose_from_kep};

/// Capture time of a camera sample, in milliseconds
pub type CameraTime = u64;

/// Identifier of a tracked feature point
pub type PointId = usize;

/// Errors raised while recording observations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("Observation of point {point} at time {time} is already recorded")]
    DuplicateObservation { time: CameraTime, point: PointId },
}

/// Pose of one temporal camera sample.
///
/// The packed `kep` vector `[ω, t]` is the optimization unknown; rotation and
/// translation (world to camera) are always derived from it, so writing a kep back
/// and reading it again is lossless.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    kep: Vector6<f64>,
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
}

impl CameraFrame {
    pub fn from_kep(kep: Vector6<f64>) -> Self {
        let (rotation, translation) = pose_from_kep(&kep);
        Self {
            kep,
            rotation,
            translation,
        }
    }

    /// Build a frame from a world-to-camera rotation and translation.
    pub fn from_pose(rotation: &Rotation3<f64>, translation: &Vector3<f64>) -> Self {
        Self::from_kep(kep_from_rotation(rotation, translation))
    }

    pub fn kep(&self) -> &Vector6<f64> {
        &self.kep
    }

    pub fn set_kep(&mut self, kep: Vector6<f64>) {
        *self = Self::from_kep(kep);
    }

    pub fn rotation(&self) -> &Rotation3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Camera center in world coordinates
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Map a world point into the camera frame
    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }
}

/// Triangulated 3D point
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedPoint {
    pub position: Vector3<f64>,
    /// Time of the first camera that observed the point
    pub first_seen: Option<CameraTime>,
}

impl ReconstructedPoint {
    pub fn new(position: Vector3<f64>) -> Self {
        Self {
            position,
            first_seen: None,
        }
    }
}

/// Key of one 2D observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointObservation {
    pub time: CameraTime,
    pub point: PointId,
}

impl PointObservation {
    pub fn new(time: CameraTime, point: PointId) -> Self {
        Self { time, point }
    }
}

/// Observation map `(camera time, point id) -> pixel` with a per-point reverse index
#[derive(Debug, Clone, Default)]
pub struct ObservationSet {
    frames: BTreeMap<CameraTime, BTreeMap<PointId, Vector2<f64>>>,
    tracks: BTreeMap<PointId, BTreeSet<CameraTime>>,
}

impl ObservationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        time: CameraTime,
        point: PointId,
        pixel: Vector2<f64>,
    ) -> Result<(), FrameError> {
        let frame = self.frames.entry(time).or_default();
        if frame.contains_key(&point) {
            return Err(FrameError::DuplicateObservation { time, point });
        }
        frame.insert(point, pixel);
        self.tracks.entry(point).or_default().insert(time);
        Ok(())
    }

    pub fn get(&self, observation: &PointObservation) -> Option<&Vector2<f64>> {
        self.frames.get(&observation.time)?.get(&observation.point)
    }

    /// Points observed at `time`, in id order
    pub fn frame(&self, time: CameraTime) -> Option<&BTreeMap<PointId, Vector2<f64>>> {
        self.frames.get(&time)
    }

    pub fn frames(&self) -> &BTreeMap<CameraTime, BTreeMap<PointId, Vector2<f64>>> {
        &self.frames
    }

    /// Times of all cameras that observed `point`, oldest first
    pub fn observers(&self, point: PointId) -> impl Iterator<Item = CameraTime> + '_ {
        self.tracks.get(&point).into_iter().flatten().copied()
    }

    pub fn is_observed_at(&self, time: CameraTime, point: PointId) -> bool {
        self.frames
            .get(&time)
            .is_some_and(|frame| frame.contains_key(&point))
    }

    /// All observations ordered by time, then point id
    pub fn iter(&self) -> impl Iterator<Item = (PointObservation, &Vector2<f64>)> + '_ {
        self.frames.iter().flat_map(|(time, frame)| {
            frame
                .iter()
                .map(move |(point, pixel)| (PointObservation::new(*time, *point), pixel))
        })
    }

    pub fn len(&self) -> usize {
        self.frames.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
