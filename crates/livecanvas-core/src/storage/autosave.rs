//! Auto-save bookkeeping for room persistence.
//!
//! Tracks which rooms have unsaved changes and when each was last saved, so
//! a background task can save every room whose interval has elapsed.

use crate::storage::Storage;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default auto-save interval in seconds.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Manages periodic persistence of room snapshots.
pub struct AutoSaveManager<S: Storage + ?Sized> {
    /// Storage backend.
    storage: Arc<S>,
    /// Auto-save interval.
    interval: Duration,
    /// Last save time per room.
    last_save: HashMap<String, Instant>,
    /// Rooms with unsaved changes.
    dirty: HashSet<String>,
}

impl<S: Storage + ?Sized> AutoSaveManager<S> {
    /// Create a new auto-save manager with the given storage backend.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            last_save: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Get the auto-save interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Mark a room as having unsaved changes.
    pub fn mark_dirty(&mut self, room: &str) {
        if !self.dirty.contains(room) {
            self.dirty.insert(room.to_string());
        }
    }

    /// Check if a room has unsaved changes.
    pub fn is_dirty(&self, room: &str) -> bool {
        self.dirty.contains(room)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Check if a room is dirty and its interval has elapsed.
    pub fn should_save(&self, room: &str, now: Instant) -> bool {
        if !self.dirty.contains(room) {
            return false;
        }
        match self.last_save.get(room) {
            Some(last) => now.saturating_duration_since(*last) >= self.interval,
            None => true,
        }
    }

    /// Dirty rooms whose interval has elapsed, sorted by id.
    pub fn due(&self, now: Instant) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .dirty
            .iter()
            .filter(|room| self.should_save(room, now))
            .cloned()
            .collect();
        rooms.sort();
        rooms
    }

    /// Clear the dirty flag of a room about to be saved. Returns whether it
    /// was set. Changes made after this call mark the room dirty again.
    pub fn take_dirty(&mut self, room: &str) -> bool {
        self.dirty.remove(room)
    }

    /// Record a completed save of `room`.
    pub fn record_saved(&mut self, room: &str, now: Instant) {
        self.last_save.insert(room.to_string(), now);
    }

    /// Forget all bookkeeping for a room.
    pub fn forget(&mut self, room: &str) {
        self.dirty.remove(room);
        self.last_save.remove(room);
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{block_on, MemoryStorage};

    fn manager() -> AutoSaveManager<MemoryStorage> {
        AutoSaveManager::new(Arc::new(MemoryStorage::new())).with_interval(Duration::from_secs(30))
    }

    #[test]
    fn test_autosave_manager_creation() {
        let manager = manager();
        assert_eq!(manager.dirty_count(), 0);
        assert!(!manager.should_save("room", Instant::now()));
        assert_eq!(manager.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_never_saved_dirty_room_is_due() {
        let mut manager = manager();
        manager.mark_dirty("room");
        manager.mark_dirty("room");
        assert_eq!(manager.dirty_count(), 1);
        assert_eq!(manager.due(Instant::now()), vec!["room".to_string()]);
    }

    #[test]
    fn test_due_respects_interval() {
        let mut manager = manager();
        let start = Instant::now();
        manager.mark_dirty("a");
        assert!(manager.take_dirty("a"));
        manager.record_saved("a", start);
        assert!(!manager.is_dirty("a"));

        manager.mark_dirty("a");
        manager.mark_dirty("b");
        assert_eq!(manager.due(start + Duration::from_secs(10)), vec!["b".to_string()]);
        assert_eq!(
            manager.due(start + Duration::from_secs(30)),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_change_during_save_stays_dirty() {
        let mut manager = manager();
        let now = Instant::now();
        manager.mark_dirty("room");
        assert!(manager.take_dirty("room"));
        assert!(!manager.take_dirty("room"));

        // Accepted while the snapshot was being written.
        manager.mark_dirty("room");
        manager.record_saved("room", now);
        assert!(manager.is_dirty("room"));
        assert!(manager.should_save("room", now + Duration::from_secs(30)));
    }

    #[test]
    fn test_dyn_storage() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let manager = AutoSaveManager::new(storage.clone());
        block_on(manager.storage().save("room", b"x")).unwrap();
        assert!(block_on(storage.exists("room")).unwrap());
    }

    #[test]
    fn test_forget() {
        let mut manager = manager();
        manager.mark_dirty("room");
        manager.forget("room");
        assert!(manager.due(Instant::now()).is_empty());
    }
}
