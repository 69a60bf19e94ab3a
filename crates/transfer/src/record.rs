use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tessera_lock::LockGuard;
use tessera_protocol::{AbortReason, DataBlockInfo, IssuedToken, TransferProgress, TransferStatus};

use crate::provider::{ResourceReader, UploadStaging};
use crate::scheduler::JobHandle;

/// Open storage handle of a transfer. Both variants may be released while
/// paused and are reopened lazily.
pub(crate) enum ContentHandle {
    Upload {
        staging: Option<Box<dyn UploadStaging>>,
    },
    Download {
        reader: Option<Box<dyn ResourceReader>>,
    },
}

/// Mutable part of a [`TransferRecord`].
pub(crate) struct RecordState {
    pub status: TransferStatus,
    pub abort_reason: Option<AbortReason>,
    /// Most recent descriptor per block number.
    pub blocks: HashMap<u64, DataBlockInfo>,
    /// Block number of the most recently applied block.
    pub latest_block: Option<u64>,
    pub transferred_bytes: u64,
    pub lock: Option<LockGuard>,
    pub expiration_job: Option<JobHandle>,
    pub content: ContentHandle,
}

impl RecordState {
    /// Records an applied block, replacing an earlier copy of the same
    /// block number.
    pub fn register_block(&mut self, info: DataBlockInfo) {
        let number = info.block_number;
        let length = info.block_length.unwrap_or(0);
        if let Some(previous) = self.blocks.insert(number, info) {
            self.transferred_bytes = self
                .transferred_bytes
                .saturating_sub(previous.block_length.unwrap_or(0));
        }
        self.transferred_bytes += length;
        self.latest_block = Some(number);
        if self.status == TransferStatus::Starting {
            self.status = TransferStatus::Running;
        }
    }

    /// Sequential backends accept the next block or a retry of the latest.
    pub fn is_in_sequence(&self, block_number: u64) -> bool {
        match self.latest_block {
            None => block_number == 0,
            Some(latest) => block_number == latest || block_number == latest + 1,
        }
    }

    /// Next block number and byte offset after the highest registered block.
    pub fn resume_point(&self) -> (u64, u64) {
        self.blocks
            .values()
            .max_by_key(|b| b.block_number)
            .map_or((0, 0), |b| {
                (b.block_number + 1, b.offset + b.block_length.unwrap_or(0))
            })
    }
}

/// Server-side bookkeeping of one transfer (thread-safe).
///
/// The state mutex is held while a block is applied, so status changes are
/// only ever observed between blocks.
pub struct TransferRecord {
    token: IssuedToken,
    state: Mutex<RecordState>,
}

impl TransferRecord {
    pub(crate) fn new(token: IssuedToken, lock: LockGuard, content: ContentHandle) -> Self {
        Self {
            token,
            state: Mutex::new(RecordState {
                status: TransferStatus::Starting,
                abort_reason: None,
                blocks: HashMap::new(),
                latest_block: None,
                transferred_bytes: 0,
                lock: Some(lock),
                expiration_job: None,
                content,
            }),
        }
    }

    pub fn token(&self) -> &IssuedToken {
        &self.token
    }

    pub fn transfer_id(&self) -> &str {
        self.token.transfer_id()
    }

    pub fn resource_id(&self) -> &str {
        &self.token.transfer().resource_id
    }

    pub fn is_upload(&self) -> bool {
        matches!(self.token, IssuedToken::Upload(_))
    }

    pub fn status(&self) -> TransferStatus {
        self.state().status
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.state().abort_reason
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.state().transferred_bytes
    }

    pub fn block(&self, block_number: u64) -> Option<DataBlockInfo> {
        self.state().blocks.get(&block_number).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.state().blocks.len()
    }

    /// Returns `true` while the record's resource lock is held and unexpired.
    pub fn holds_lock(&self) -> bool {
        self.state().lock.as_ref().is_some_and(|g| g.is_active())
    }

    pub fn expiration_job(&self) -> Option<JobHandle> {
        self.state().expiration_job
    }

    /// Next block number and offset a resumed upload continues from.
    pub fn resume_point(&self) -> (u64, u64) {
        self.state().resume_point()
    }

    pub fn progress(&self) -> TransferProgress {
        let s = self.state();
        TransferProgress {
            transfer_id: self.transfer_id().to_string(),
            status: s.status,
            total_bytes: self.token.transfer().resource_length,
            transferred_bytes: s.transferred_bytes,
            block_count: s.blocks.len() as u64,
        }
    }

    pub(crate) fn set_expiration_job(&self, job: JobHandle) {
        self.state().expiration_job = Some(job);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap()
    }
}

impl std::fmt::Debug for TransferRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRecord")
            .field("transfer_id", &self.transfer_id())
            .field("resource_id", &self.resource_id())
            .finish_non_exhaustive()
    }
}
