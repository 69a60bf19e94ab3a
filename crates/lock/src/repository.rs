use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::guard::LockGuard;
use crate::item::{LockItem, LockType, ResourceLockState};
use crate::tracker::ResourceLockTracker;

/// Registry of lock trackers keyed by resource id (thread-safe).
///
/// Trackers are created lazily on first access. The map lock is only held
/// long enough to look up or insert a tracker; lock decisions happen under
/// the tracker's own mutex.
#[derive(Default)]
pub struct LockRepository {
    trackers: RwLock<HashMap<String, Arc<ResourceLockTracker>>>,
}

impl LockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tracker for `resource_id`, creating it if necessary.
    pub fn tracker(&self, resource_id: &str) -> Arc<ResourceLockTracker> {
        {
            let map = self.trackers.read().unwrap();
            if let Some(tracker) = map.get(resource_id) {
                return Arc::clone(tracker);
            }
        }
        let mut map = self.trackers.write().unwrap();
        Arc::clone(
            map.entry(resource_id.to_string())
                .or_insert_with(|| Arc::new(ResourceLockTracker::new(resource_id))),
        )
    }

    fn existing_tracker(&self, resource_id: &str) -> Option<Arc<ResourceLockTracker>> {
        let map = self.trackers.read().unwrap();
        map.get(resource_id).cloned()
    }

    pub fn try_read_lock(&self, resource_id: &str, timeout: Option<Duration>) -> LockItem {
        self.tracker(resource_id).try_read_lock(timeout)
    }

    pub fn try_write_lock(&self, resource_id: &str, timeout: Option<Duration>) -> LockItem {
        self.tracker(resource_id).try_write_lock(timeout)
    }

    /// Requests a lock of the given type. Requesting [`LockType::Denied`]
    /// yields a denied item.
    pub fn try_lock(
        &self,
        resource_id: &str,
        lock_type: LockType,
        timeout: Option<Duration>,
    ) -> LockItem {
        match lock_type {
            LockType::Read => self.try_read_lock(resource_id, timeout),
            LockType::Write => self.try_write_lock(resource_id, timeout),
            LockType::Denied => LockItem::denied(resource_id),
        }
    }

    /// Releases a lock. Returns `false` if it was not registered.
    pub fn release(&self, lock: &LockItem) -> bool {
        if !lock.is_enabled() {
            return false;
        }
        match self.existing_tracker(&lock.resource_id) {
            Some(tracker) => tracker.release(lock),
            None => false,
        }
    }

    /// Returns the lock state of a resource without creating a tracker.
    pub fn lock_state(&self, resource_id: &str) -> ResourceLockState {
        self.existing_tracker(resource_id)
            .map(|t| t.state())
            .unwrap_or(ResourceLockState::Unlocked)
    }

    /// Returns `true` if `lock` is still granted and unexpired.
    pub fn is_lock_active(&self, lock: &LockItem) -> bool {
        self.existing_tracker(&lock.resource_id)
            .is_some_and(|t| t.is_active(lock))
    }

    /// Number of trackers currently registered.
    pub fn tracker_count(&self) -> usize {
        self.trackers.read().unwrap().len()
    }

    /// Sweeps expired locks and drops trackers that hold nothing.
    ///
    /// A tracker is only dropped when no other thread holds a reference to
    /// it, so an acquisition racing with the sweep always lands on the
    /// tracker that stays registered. Returns the number of trackers removed.
    pub fn prune(&self) -> usize {
        let mut map = self.trackers.write().unwrap();
        let before = map.len();
        map.retain(|_, tracker| {
            tracker.purge_expired();
            Arc::strong_count(tracker) > 1 || !tracker.is_empty()
        });
        let removed = before - map.len();
        if removed > 0 {
            debug!(removed, remaining = map.len(), "pruned idle lock trackers");
        }
        removed
    }

    /// Attempts a single lock and wraps the outcome in a guard.
    pub fn acquire(
        self: &Arc<Self>,
        resource_id: &str,
        lock_type: LockType,
        timeout: Option<Duration>,
    ) -> LockGuard {
        let lock = self.try_lock(resource_id, lock_type, timeout);
        LockGuard::new(Arc::clone(self), lock, Vec::new())
    }

    /// Locks `resource_id` plus a read lock on every ancestor folder.
    ///
    /// The ancestor read locks keep the folders from being deleted or
    /// renamed while the primary lock is held. If any lock is denied, all
    /// locks granted during this attempt are released again and a denied
    /// guard is returned.
    pub fn acquire_with_ancestors(
        self: &Arc<Self>,
        resource_id: &str,
        lock_type: LockType,
        ancestors: &[String],
        timeout: Option<Duration>,
    ) -> LockGuard {
        let primary = self.try_lock(resource_id, lock_type, timeout);
        if !primary.is_enabled() {
            return LockGuard::denied(Arc::clone(self), resource_id);
        }

        let mut secondary = Vec::with_capacity(ancestors.len());
        for folder in ancestors {
            let lock = self.try_read_lock(folder, timeout);
            if !lock.is_enabled() {
                debug!(
                    resource = %resource_id,
                    folder = %folder,
                    "ancestor lock denied, rolling back"
                );
                self.rollback(&primary, &secondary);
                return LockGuard::denied(Arc::clone(self), resource_id);
            }
            secondary.push(lock);
        }

        LockGuard::new(Arc::clone(self), primary, secondary)
    }

    fn rollback(&self, primary: &LockItem, secondary: &[LockItem]) {
        for lock in std::iter::once(primary).chain(secondary) {
            if !self.release(lock) {
                warn!(
                    resource = %lock.resource_id,
                    lock = %lock.lock_id,
                    "rollback could not release lock"
                );
            }
        }
    }
}
