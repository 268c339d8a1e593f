//! Subscriber Registry
//!
//! Centrals that have enabled notifications and are still connected.

use crate::domain::models::CentralId;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Effect of a registry mutation on overall occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    /// Membership did not change.
    Unchanged,
    /// Membership changed, registry was and still is non-empty.
    Changed,
    /// First subscriber added.
    BecameNonEmpty,
    /// Last subscriber removed.
    BecameEmpty,
}

#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    centrals: Mutex<HashSet<CentralId>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn centrals(&self) -> MutexGuard<'_, HashSet<CentralId>> {
        self.centrals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a central. Adding an existing member is a no-op.
    pub fn insert(&self, central: CentralId) -> Occupancy {
        let mut centrals = self.centrals();
        let was_empty = centrals.is_empty();
        if !centrals.insert(central) {
            Occupancy::Unchanged
        } else if was_empty {
            Occupancy::BecameNonEmpty
        } else {
            Occupancy::Changed
        }
    }

    /// Removes a central. Removing an absent central is a no-op.
    pub fn remove(&self, central: &CentralId) -> Occupancy {
        let mut centrals = self.centrals();
        if !centrals.remove(central) {
            Occupancy::Unchanged
        } else if centrals.is_empty() {
            Occupancy::BecameEmpty
        } else {
            Occupancy::Changed
        }
    }

    pub fn contains(&self, central: &CentralId) -> bool {
        self.centrals().contains(central)
    }

    pub fn len(&self) -> usize {
        self.centrals().len()
    }

    pub fn is_empty(&self) -> bool {
        self.centrals().is_empty()
    }

    /// Copy of the current members, safe to iterate while the registry changes.
    pub fn snapshot(&self) -> Vec<CentralId> {
        self.centrals().iter().cloned().collect()
    }

    /// Removes every member, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut centrals = self.centrals();
        let count = centrals.len();
        centrals.clear();
        count
    }
}
