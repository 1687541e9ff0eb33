//! Tri-partition state ledger
//!
//! A [`MarginalizedMap`] holds every element of one collection (cameras or points)
//! in exactly one of three ordered partitions:
//!
//! - `active`: freely refined by the optimizer
//! - `linearized`: still refined, but its Jacobian blocks are evaluated at a frozen copy
//! - `marginalized`: summarized into the prior, no longer an unknown
//!
//! Transitions are strictly `Active -> Linearized -> Marginalized`. The combined
//! traversal visits marginalized, then linearized, then active elements, each
//! partition in key order, so forward iteration is oldest-first and reverse
//! iteration yields the newest active element first.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a ledger element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Active,
    Linearized,
    Marginalized,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Linearized => write!(f, "linearized"),
            LifecycleState::Marginalized => write!(f, "marginalized"),
        }
    }
}

/// Ledger protocol violations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("Key {0} is already present in the ledger")]
    DuplicateKey(String),
    #[error("Key {0} not found in the ledger")]
    MissingKey(String),
    #[error("Invalid transition of {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Borrowed view of one ledger element during traversal
#[derive(Debug, Clone, Copy)]
pub struct LedgerEntry<'a, K, V> {
    pub key: &'a K,
    pub value: &'a V,
    pub state: LifecycleState,
}

/// Three disjoint ordered maps behind one interface
#[derive(Debug, Clone)]
pub struct MarginalizedMap<K, V> {
    active: BTreeMap<K, V>,
    linearized: BTreeMap<K, V>,
    marginalized: BTreeMap<K, V>,
}

impl<K, V> Default for MarginalizedMap<K, V> {
    fn default() -> Self {
        Self {
            active: BTreeMap::new(),
            linearized: BTreeMap::new(),
            marginalized: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Copy + fmt::Debug, V> MarginalizedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new element into the active partition.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), LedgerError> {
        if self.contains_key(&key) {
            return Err(LedgerError::DuplicateKey(format!("{key:?}")));
        }
        self.active.insert(key, value);
        Ok(())
    }

    pub fn state(&self, key: &K) -> Option<LifecycleState> {
        if self.active.contains_key(key) {
            Some(LifecycleState::Active)
        } else if self.linearized.contains_key(key) {
            Some(LifecycleState::Linearized)
        } else if self.marginalized.contains_key(key) {
            Some(LifecycleState::Marginalized)
        } else {
            None
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.state(key).is_some()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.active
            .get(key)
            .or_else(|| self.linearized.get(key))
            .or_else(|| self.marginalized.get(key))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.state(key)? {
            LifecycleState::Active => self.active.get_mut(key),
            LifecycleState::Linearized => self.linearized.get_mut(key),
            LifecycleState::Marginalized => self.marginalized.get_mut(key),
        }
    }

    pub fn entry(&self, key: &K) -> Option<LedgerEntry<'_, K, V>> {
        let state = self.state(key)?;
        let (key, value) = self.partition(state).get_key_value(key)?;
        Some(LedgerEntry { key, value, state })
    }

    /// Remove an element from whichever partition holds it. Used when an element
    /// leaves the reconstruction entirely, not for marginalization.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.active
            .remove(key)
            .or_else(|| self.linearized.remove(key))
            .or_else(|| self.marginalized.remove(key))
    }

    /// Move an active element to the linearized partition.
    pub fn move_to_linearized(&mut self, key: &K) -> Result<(), LedgerError> {
        match self.active.remove(key) {
            Some(value) => {
                self.linearized.insert(*key, value);
                Ok(())
            }
            None => Err(self.transition_error(key, LifecycleState::Linearized)),
        }
    }

    /// Move a linearized element to the marginalized partition.
    pub fn move_to_marginalized(&mut self, key: &K) -> Result<(), LedgerError> {
        match self.linearized.remove(key) {
            Some(value) => {
                self.marginalized.insert(*key, value);
                Ok(())
            }
            None => Err(self.transition_error(key, LifecycleState::Marginalized)),
        }
    }

    fn transition_error(&self, key: &K, to: LifecycleState) -> LedgerError {
        match self.state(key) {
            Some(from) => LedgerError::InvalidTransition {
                key: format!("{key:?}"),
                from,
                to,
            },
            None => LedgerError::MissingKey(format!("{key:?}")),
        }
    }

    fn partition(&self, state: LifecycleState) -> &BTreeMap<K, V> {
        match state {
            LifecycleState::Active => &self.active,
            LifecycleState::Linearized => &self.linearized,
            LifecycleState::Marginalized => &self.marginalized,
        }
    }

    pub fn active(&self) -> &BTreeMap<K, V> {
        &self.active
    }

    pub fn linearized(&self) -> &BTreeMap<K, V> {
        &self.linearized
    }

    pub fn marginalized(&self) -> &BTreeMap<K, V> {
        &self.marginalized
    }

    /// Combined traversal: marginalized, linearized, then active.
    ///
    /// Use `.rev()` for the newest-first order (active, linearized, marginalized).
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = LedgerEntry<'_, K, V>> + '_ {
        self.marginalized
            .iter()
            .map(tagged(LifecycleState::Marginalized))
            .chain(self.linearized.iter().map(tagged(LifecycleState::Linearized)))
            .chain(self.active.iter().map(tagged(LifecycleState::Active)))
    }

    /// Keys of every element that is still an unknown, in key order.
    pub fn unmarginalized_keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self
            .active
            .keys()
            .chain(self.linearized.keys())
            .copied()
            .collect();
        keys.sort();
        keys
    }

    /// Number of active plus linearized elements
    pub fn num_unmarginalized(&self) -> usize {
        self.active.len() + self.linearized.len()
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.linearized.len() + self.marginalized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tagged<'a, K, V>(
    state: LifecycleState,
) -> impl Fn((&'a K, &'a V)) -> LedgerEntry<'a, K, V> + Clone {
    move |(key, value)| LedgerEntry { key, value, state }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ledger() -> MarginalizedMap<u64, &'static str> {
        let mut map = MarginalizedMap::new();
        for (key, value) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
            map.insert(key, value).unwrap();
        }
        map
    }

    #[test]
    fn test_transitions_follow_protocol() {
        let mut map = ledger();
        map.move_to_linearized(&2).unwrap();
        assert_eq!(map.state(&2), Some(LifecycleState::Linearized));
        map.move_to_marginalized(&2).unwrap();
        assert_eq!(map.state(&2), Some(LifecycleState::Marginalized));
        assert_eq!(map.get(&2), Some(&"b"));
        assert_eq!(map.num_unmarginalized(), 3);
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_invalid_transitions_fail() {
        let mut map = ledger();
        // Skipping the linearized state is not allowed.
        assert!(matches!(
            map.move_to_marginalized(&1),
            Err(LedgerError::InvalidTransition {
                from: LifecycleState::Active,
                to: LifecycleState::Marginalized,
                ..
            })
        ));
        map.move_to_linearized(&1).unwrap();
        assert!(matches!(
            map.move_to_linearized(&1),
            Err(LedgerError::InvalidTransition {
                from: LifecycleState::Linearized,
                ..
            })
        ));
        assert!(matches!(
            map.move_to_linearized(&99),
            Err(LedgerError::MissingKey(_))
        ));
        assert!(matches!(
            map.insert(1, "again"),
            Err(LedgerError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_key_lives_in_one_partition() {
        let mut map = ledger();
        let partitions = |map: &MarginalizedMap<u64, &str>, key: u64| {
            [map.active(), map.linearized(), map.marginalized()]
                .iter()
                .filter(|partition| partition.contains_key(&key))
                .count()
        };
        map.move_to_linearized(&4).unwrap();
        assert_eq!(partitions(&map, 4), 1);
        map.move_to_marginalized(&4).unwrap();
        assert_eq!(partitions(&map, 4), 1);

        assert!(matches!(
            map.move_to_marginalized(&4),
            Err(LedgerError::InvalidTransition {
                from: LifecycleState::Marginalized,
                ..
            })
        ));
        assert!(matches!(map.insert(4, "again"), Err(LedgerError::DuplicateKey(_))));
        assert_eq!(partitions(&map, 4), 1);
        assert_eq!(map.get(&4), Some(&"d"));
    }

    #[test]
    fn test_combined_iteration_order() {
        let mut map = ledger();
        map.move_to_linearized(&3).unwrap();
        map.move_to_linearized(&1).unwrap();
        map.move_to_marginalized(&1).unwrap();

        let forward: Vec<(u64, LifecycleState)> =
            map.iter().map(|entry| (*entry.key, entry.state)).collect();
        assert_eq!(
            forward,
            vec![
                (1, LifecycleState::Marginalized),
                (3, LifecycleState::Linearized),
                (2, LifecycleState::Active),
                (4, LifecycleState::Active),
            ]
        );

        let newest = map.iter().next_back().unwrap();
        assert_eq!(*newest.key, 4);
        let reverse: Vec<u64> = map.iter().rev().map(|entry| *entry.key).collect();
        assert_eq!(reverse, vec![4, 2, 3, 1]);
        assert_eq!(map.unmarginalized_keys(), vec![2, 3, 4]);
    }

    #[test]
    fn test_get_mut_and_remove() {
        let mut map = ledger();
        map.move_to_linearized(&4).unwrap();
        *map.get_mut(&4).unwrap() = "z";
        assert_eq!(map.entry(&4).unwrap().value, &"z");
        assert_eq!(map.remove(&4), Some("z"));
        assert!(!map.contains_key(&4));
    }
}
