//! Column index sets for one elimination step

use std::collections::BTreeSet;

use crate::bundle::{BundleError, GlobalBundle};
use crate::core::frames::{CameraTime, PointId};

/// Keep-set (`ids_a`) and eliminate-set (`ids_b`) expressed in the column layout
/// of one [`GlobalBundle`].
#[derive(Debug)]
pub struct MarginalizationIds<'a> {
    bundle: &'a GlobalBundle,
    keep: BTreeSet<usize>,
    eliminate: BTreeSet<usize>,
}

impl<'a> MarginalizationIds<'a> {
    pub fn new(bundle: &'a GlobalBundle) -> Self {
        Self {
            bundle,
            keep: BTreeSet::new(),
            eliminate: BTreeSet::new(),
        }
    }

    /// Keep the camera's columns in the reduced system.
    pub fn linearize_camera(&mut self, time: CameraTime) -> Result<(), BundleError> {
        self.keep.extend(self.bundle.camera_columns(time)?);
        Ok(())
    }

    pub fn linearize_point(&mut self, point: PointId) -> Result<(), BundleError> {
        self.keep.extend(self.bundle.point_columns(point)?);
        Ok(())
    }

    /// Eliminate the camera's columns.
    pub fn marginalize_camera(&mut self, time: CameraTime) -> Result<(), BundleError> {
        self.eliminate.extend(self.bundle.camera_columns(time)?);
        Ok(())
    }

    pub fn marginalize_point(&mut self, point: PointId) -> Result<(), BundleError> {
        self.eliminate.extend(self.bundle.point_columns(point)?);
        Ok(())
    }

    /// Kept columns, excluding anything also scheduled for elimination
    pub fn ids_a(&self) -> Vec<usize> {
        self.keep.difference(&self.eliminate).copied().collect()
    }

    pub fn ids_b(&self) -> Vec<usize> {
        self.eliminate.iter().copied().collect()
    }
}
