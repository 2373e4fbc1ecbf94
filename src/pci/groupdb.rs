//! Cached group levels, shared read-only with the bridge.
//!
//! The engine is the only writer; the bridge holds a clone and reads through
//! the same lock, which is the serialising boundary required for sharing
//! across threads. Contents are volatile: the cache is dropped on disconnect
//! and rebuilt by the resync controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::protocol::application;

/// Last known level per `(application, group)`.
#[derive(Clone, Debug, Default)]
pub struct GroupDb {
    inner: Arc<Mutex<HashMap<(u8, u8), u8>>>,
}

impl GroupDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known level for a group, if any report or broadcast covered it.
    pub fn level(&self, application: u8, group: u8) -> Option<u8> {
        self.lock().get(&(application, group)).copied()
    }

    /// Number of groups with a known level.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Distinct lighting applications with at least one known group.
    pub fn lighting_applications(&self) -> Vec<u8> {
        let mut apps: Vec<u8> = self
            .lock()
            .keys()
            .map(|&(app, _)| app)
            .filter(|&app| application::is_lighting(app))
            .collect();
        apps.sort_unstable();
        apps.dedup();
        apps
    }

    /// Record a level; returns true when the cached value actually changed
    /// (or was previously unknown).
    pub(crate) fn set_level(&self, application: u8, group: u8, level: u8) -> bool {
        self.lock().insert((application, group), level) != Some(level)
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(u8, u8), u8>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_level_reports_changes() {
        let db = GroupDb::new();
        assert_eq!(db.level(0x38, 100), None);
        assert!(db.set_level(0x38, 100, 255));
        assert!(!db.set_level(0x38, 100, 255));
        assert!(db.set_level(0x38, 100, 0));
        assert_eq!(db.level(0x38, 100), Some(0));
    }

    #[test]
    fn lighting_applications_ignores_other_traffic() {
        let db = GroupDb::new();
        db.set_level(0x38, 1, 255);
        db.set_level(0x3A, 2, 0);
        db.set_level(0x19, 3, 21); // temperature, not lighting
        assert_eq!(db.lighting_applications(), vec![0x38, 0x3A]);
    }

    #[test]
    fn clear_empties_the_cache() {
        let db = GroupDb::new();
        db.set_level(0x38, 1, 128);
        db.clear();
        assert!(db.is_empty());
    }
}
