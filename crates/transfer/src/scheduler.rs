//! One-shot job scheduling used for transfer expiration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Work executed once by a [`Scheduler`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled job for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    id: u64,
}

impl JobHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Runs jobs at a point in time.
pub trait Scheduler: Send + Sync {
    /// Schedules `job` to run once at `when` (immediately if in the past).
    fn schedule_once(&self, when: DateTime<Utc>, job: Job) -> JobHandle;

    /// Cancels a pending job. Returns `false` if it already ran or was
    /// cancelled before.
    fn cancel(&self, handle: &JobHandle) -> bool;
}

/// Scheduler backed by tokio timers.
///
/// Each job is a spawned task racing a sleep against a cancellation token.
pub struct TokioScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a scheduler on the runtime of the calling task.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Number of jobs that have neither run nor been cancelled.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, when: DateTime<Utc>, job: Job) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = (when - Utc::now()).to_std().unwrap_or_default();
        let token = CancellationToken::new();
        self.pending.lock().unwrap().insert(id, token.clone());

        let pending = Arc::clone(&self.pending);
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(job = id, "scheduled job cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let still_pending = pending.lock().unwrap().remove(&id).is_some();
                    if still_pending {
                        job();
                    }
                }
            }
        });

        JobHandle::new(id)
    }

    fn cancel(&self, handle: &JobHandle) -> bool {
        match self.pending.lock().unwrap().remove(&handle.id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
