use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::CLEANUP_INTERVAL;
use crate::item::{LockItem, LockType, ResourceLockState};

/// Lock state machine of a single resource (thread-safe).
///
/// Each tracker guards its own state, so trackers of unrelated resources
/// never contend with each other.
pub struct ResourceLockTracker {
    resource_id: String,
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    read_locks: HashMap<String, LockItem>,
    write_lock: Option<LockItem>,
    cleanup_counter: u32,
}

impl TrackerInner {
    fn has_active_write(&self, now: DateTime<Utc>) -> bool {
        self.write_lock.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    fn active_read_count(&self, now: DateTime<Utc>) -> usize {
        self.read_locks
            .values()
            .filter(|l| !l.is_expired(now))
            .count()
    }

    fn state(&self, now: DateTime<Utc>) -> ResourceLockState {
        if self.has_active_write(now) {
            ResourceLockState::Locked
        } else if self.active_read_count(now) > 0 {
            ResourceLockState::ReadOnly
        } else {
            ResourceLockState::Unlocked
        }
    }

    /// Counts one operation and sweeps expired items every
    /// [`CLEANUP_INTERVAL`] operations.
    fn tick(&mut self, now: DateTime<Utc>) {
        self.cleanup_counter += 1;
        if self.cleanup_counter >= CLEANUP_INTERVAL {
            self.cleanup_counter = 0;
            self.purge(now);
        }
    }

    fn purge(&mut self, now: DateTime<Utc>) {
        self.read_locks.retain(|_, l| !l.is_expired(now));
        if self.write_lock.as_ref().is_some_and(|l| l.is_expired(now)) {
            self.write_lock = None;
        }
    }
}

impl ResourceLockTracker {
    /// Creates an unlocked tracker for `resource_id`.
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            inner: Mutex::new(TrackerInner {
                read_locks: HashMap::new(),
                write_lock: None,
                cleanup_counter: 0,
            }),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Requests a shared read lock.
    ///
    /// Granted unless an unexpired write lock exists. `timeout` of `None`
    /// never expires.
    pub fn try_read_lock(&self, timeout: Option<Duration>) -> LockItem {
        let now = Utc::now();
        let mut s = self.inner.lock().unwrap();
        s.tick(now);

        if s.has_active_write(now) {
            trace!(resource = %self.resource_id, "read lock denied");
            return LockItem::denied(&self.resource_id);
        }

        let item = LockItem::grant(&self.resource_id, LockType::Read, timeout, now);
        s.read_locks.insert(item.lock_id.clone(), item.clone());
        trace!(resource = %self.resource_id, lock = %item.lock_id, "read lock granted");
        item
    }

    /// Requests the exclusive write lock.
    ///
    /// Granted only if there is neither an unexpired write lock nor any
    /// unexpired read lock.
    pub fn try_write_lock(&self, timeout: Option<Duration>) -> LockItem {
        let now = Utc::now();
        let mut s = self.inner.lock().unwrap();
        s.tick(now);

        if s.state(now) != ResourceLockState::Unlocked {
            trace!(resource = %self.resource_id, "write lock denied");
            return LockItem::denied(&self.resource_id);
        }

        // Anything left over at this point is expired and inert.
        s.purge(now);
        let item = LockItem::grant(&self.resource_id, LockType::Write, timeout, now);
        s.write_lock = Some(item.clone());
        trace!(resource = %self.resource_id, lock = %item.lock_id, "write lock granted");
        item
    }

    /// Releases a previously granted lock.
    ///
    /// Returns `false` if the item is denied, belongs to another resource,
    /// or is no longer registered (already released or swept after expiry).
    pub fn release(&self, lock: &LockItem) -> bool {
        if !lock.is_enabled() || lock.resource_id != self.resource_id {
            return false;
        }

        let now = Utc::now();
        let mut s = self.inner.lock().unwrap();
        s.tick(now);

        match lock.lock_type {
            LockType::Read => s.read_locks.remove(&lock.lock_id).is_some(),
            LockType::Write => {
                let matches = s
                    .write_lock
                    .as_ref()
                    .is_some_and(|w| w.lock_id == lock.lock_id);
                if matches {
                    s.write_lock = None;
                }
                matches
            }
            LockType::Denied => false,
        }
    }

    /// Returns `true` if `lock` is registered here and not expired.
    pub fn is_active(&self, lock: &LockItem) -> bool {
        let now = Utc::now();
        let s = self.inner.lock().unwrap();
        let registered = match lock.lock_type {
            LockType::Read => s.read_locks.get(&lock.lock_id),
            LockType::Write => s
                .write_lock
                .as_ref()
                .filter(|w| w.lock_id == lock.lock_id),
            LockType::Denied => None,
        };
        registered.is_some_and(|l| !l.is_expired(now))
    }

    /// Returns the current lock state, ignoring expired items.
    pub fn state(&self) -> ResourceLockState {
        let s = self.inner.lock().unwrap();
        s.state(Utc::now())
    }

    /// Number of unexpired read locks.
    pub fn active_read_count(&self) -> usize {
        let s = self.inner.lock().unwrap();
        s.active_read_count(Utc::now())
    }

    /// Removes expired items immediately.
    pub fn purge_expired(&self) {
        let mut s = self.inner.lock().unwrap();
        s.purge(Utc::now());
    }

    /// Returns `true` if the tracker holds no items at all, expired or not.
    pub(crate) fn is_empty(&self) -> bool {
        let s = self.inner.lock().unwrap();
        s.read_locks.is_empty() && s.write_lock.is_none()
    }

    #[cfg(test)]
    fn stored_item_count(&self) -> usize {
        let s = self.inner.lock().unwrap();
        s.read_locks.len() + usize::from(s.write_lock.is_some())
    }
}
