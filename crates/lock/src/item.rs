use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Kind of lock held on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
    /// Result of an acquisition attempt that was not granted.
    Denied,
}

/// Aggregate lock state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLockState {
    Unlocked,
    /// One or more read locks are active.
    ReadOnly,
    /// A write lock is active.
    Locked,
}

/// One lock grant (or a denied attempt).
///
/// Denied items are ordinary return values, not errors: check
/// [`is_enabled`](Self::is_enabled) before relying on a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockItem {
    pub resource_id: String,
    /// Unique per grant; empty for denied items.
    pub lock_id: String,
    pub lock_type: LockType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl LockItem {
    /// Creates a granted lock expiring `timeout` after `now`.
    pub(crate) fn grant(
        resource_id: &str,
        lock_type: LockType,
        timeout: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Self {
        let expiration = timeout.and_then(|t| {
            TimeDelta::from_std(t)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
        });
        Self {
            resource_id: resource_id.to_string(),
            lock_id: uuid::Uuid::new_v4().to_string(),
            lock_type,
            expiration,
        }
    }

    /// Creates a denied item for `resource_id`.
    pub fn denied(resource_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            lock_id: String::new(),
            lock_type: LockType::Denied,
            expiration: None,
        }
    }

    /// Returns `true` if the lock was granted.
    pub fn is_enabled(&self) -> bool {
        self.lock_type != LockType::Denied
    }

    /// Returns `true` if the lock has an expiration at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }
}
