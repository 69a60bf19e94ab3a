//! Resource locking for the Tessera transfer core.
//!
//! Each resource gets a [`ResourceLockTracker`] granting either any number of
//! shared read locks or a single exclusive write lock. Locks may carry an
//! expiration so that a client that disappears mid-transfer cannot keep a
//! resource locked forever: expired locks are ignored by every state check
//! and swept out lazily.
//!
//! A [`LockRepository`] maps resource ids to trackers. It is constructed
//! explicitly and shared through an `Arc` by whoever hosts the transfer
//! handlers. Acquisitions go through [`LockGuard`], which releases its locks
//! when dropped.

mod guard;
mod item;
mod repository;
mod tracker;

pub use guard::LockGuard;
pub use item::{LockItem, LockType, ResourceLockState};
pub use repository::LockRepository;
pub use tracker::ResourceLockTracker;

/// Number of lock operations on a tracker between two sweeps of expired items.
pub const CLEANUP_INTERVAL: u32 = 100;
