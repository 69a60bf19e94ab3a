use std::sync::Arc;

use tracing::warn;

use crate::item::LockItem;
use crate::repository::LockRepository;

/// Scoped ownership of a primary lock and its secondary (ancestor) locks.
///
/// Dropping the guard releases every lock it holds. A denied guard holds
/// nothing and releasing it is a no-op.
pub struct LockGuard {
    repository: Arc<LockRepository>,
    lock: LockItem,
    secondary: Vec<LockItem>,
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(
        repository: Arc<LockRepository>,
        lock: LockItem,
        secondary: Vec<LockItem>,
    ) -> Self {
        Self {
            repository,
            lock,
            secondary,
            released: false,
        }
    }

    pub(crate) fn denied(repository: Arc<LockRepository>, resource_id: &str) -> Self {
        Self::new(repository, LockItem::denied(resource_id), Vec::new())
    }

    /// Returns `true` if the primary lock was granted.
    pub fn is_lock_enabled(&self) -> bool {
        self.lock.is_enabled()
    }

    pub fn lock(&self) -> &LockItem {
        &self.lock
    }

    pub fn secondary_locks(&self) -> &[LockItem] {
        &self.secondary
    }

    /// Returns `true` while the primary lock is registered and unexpired.
    pub fn is_active(&self) -> bool {
        !self.released && self.repository.is_lock_active(&self.lock)
    }

    /// Releases the primary lock, then every secondary lock.
    ///
    /// Each release is attempted independently; failures are logged.
    /// Calling this more than once has no further effect.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.lock.is_enabled() {
            return;
        }

        for lock in std::iter::once(&self.lock).chain(&self.secondary) {
            if !self.repository.release(lock) {
                warn!(
                    resource = %lock.resource_id,
                    lock = %lock.lock_id,
                    "lock was not registered at release"
                );
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.lock)
            .field("secondary", &self.secondary)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
