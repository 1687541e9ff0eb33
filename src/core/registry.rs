//! Variable registry
//!
//! Every scalar unknown of the bundle (one per camera degree of freedom, one per
//! point coordinate) receives a process-unique [`Uuid`] the first time it shows up
//! in a Jacobian build. Column indices change whenever the window is rebuilt, the
//! identifiers never do, which is what lets the marginalization prior be scattered
//! back onto the correct columns after every rebuild.
//!
//! Identifiers are minted from a monotonically increasing counter and are never
//! reused or removed.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::core::frames::{CameraTime, PointId};

/// Number of external parameters per camera (rotation vector + translation)
pub const CAMERA_DOF: usize = 6;

/// Number of coordinates per reconstructed point
pub const POINT_DOF: usize = 3;

/// Registry specific error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("Unknown variable {0}")]
    UnknownVariable(VariableKey),
    #[error("Degree of freedom {dim} out of range for {kind} (expected < {max})")]
    InvalidDimension {
        kind: &'static str,
        dim: usize,
        max: usize,
    },
}

/// Stable identifier of one scalar optimization variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid(pub u64);

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uuid#{}", self.0)
    }
}

/// Logical name of a scalar unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableKey {
    /// One of the 6 kep entries of the camera sampled at `time`
    CameraDof { time: CameraTime, dim: usize },
    /// One of the 3 coordinates of a reconstructed point
    PointDof { point: PointId, dim: usize },
}

impl VariableKey {
    pub fn camera(time: CameraTime, dim: usize) -> Self {
        VariableKey::CameraDof { time, dim }
    }

    pub fn point(point: PointId, dim: usize) -> Self {
        VariableKey::PointDof { point, dim }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        match *self {
            VariableKey::CameraDof { dim, .. } if dim >= CAMERA_DOF => {
                Err(RegistryError::InvalidDimension {
                    kind: "camera",
                    dim,
                    max: CAMERA_DOF,
                })
            }
            VariableKey::PointDof { dim, .. } if dim >= POINT_DOF => {
                Err(RegistryError::InvalidDimension {
                    kind: "point",
                    dim,
                    max: POINT_DOF,
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableKey::CameraDof { time, dim } => write!(f, "camera(t={time})[{dim}]"),
            VariableKey::PointDof { point, dim } => write!(f, "point({point})[{dim}]"),
        }
    }
}

/// A registered variable: its identifier together with the key it was minted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable {
    pub uuid: Uuid,
    pub key: VariableKey,
}

/// Arena of variable identifiers keyed by [`VariableKey`]
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    next: u64,
    ids: HashMap<VariableKey, Uuid>,
    keys: HashMap<Uuid, VariableKey>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the identifier of `key`, minting a new one on first sight.
    pub fn generate(&mut self, key: VariableKey) -> Result<Uuid, RegistryError> {
        key.validate()?;
        if let Some(uuid) = self.ids.get(&key) {
            return Ok(*uuid);
        }
        let uuid = Uuid(self.next);
        self.next += 1;
        self.ids.insert(key, uuid);
        self.keys.insert(uuid, key);
        Ok(uuid)
    }

    /// Look up a previously generated identifier.
    pub fn get(&self, key: &VariableKey) -> Result<Uuid, RegistryError> {
        self.ids
            .get(key)
            .copied()
            .ok_or(RegistryError::UnknownVariable(*key))
    }

    /// Reverse lookup, used for diagnostics.
    pub fn variable(&self, uuid: Uuid) -> Option<Variable> {
        self.keys.get(&uuid).map(|key| Variable { uuid, key: *key })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_idempotent() {
        let mut registry = VariableRegistry::new();
        let a = registry.generate(VariableKey::camera(10, 0)).unwrap();
        let b = registry.generate(VariableKey::point(3, 2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.generate(VariableKey::camera(10, 0)).unwrap(), a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_get_unknown_fails() {
        let mut registry = VariableRegistry::new();
        registry.generate(VariableKey::point(1, 0)).unwrap();
        assert!(registry.get(&VariableKey::point(1, 0)).is_ok());
        assert_eq!(
            registry.get(&VariableKey::point(1, 1)),
            Err(RegistryError::UnknownVariable(VariableKey::point(1, 1)))
        );
    }

    #[test]
    fn test_dimension_is_validated() {
        let mut registry = VariableRegistry::new();
        assert!(registry.generate(VariableKey::camera(0, CAMERA_DOF)).is_err());
        assert!(registry.generate(VariableKey::point(0, POINT_DOF)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_identifiers_are_never_reused() {
        let mut registry = VariableRegistry::new();
        let ids: Vec<Uuid> = (0..CAMERA_DOF)
            .map(|dim| registry.generate(VariableKey::camera(5, dim)).unwrap())
            .collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        let variable = registry.variable(ids[3]).unwrap();
        assert_eq!(variable.key, VariableKey::camera(5, 3));
    }
}
