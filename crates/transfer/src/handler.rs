//! Transfer orchestration.
//!
//! [`TransferHandler`] issues upload and download tokens, applies data
//! blocks, and drives every transfer to exactly one terminal state. Each
//! transfer holds a lock on its resource (write for uploads, read for
//! downloads) plus read locks on the resource's ancestor folders until it
//! completes, is cancelled, or expires.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tessera_lock::{LockGuard, LockRepository, LockType};
use tessera_protocol::{
    AbortReason, BufferedDataBlock, DataBlockInfo, DownloadToken, IssuedToken,
    StreamedDataBlock, TransferCapabilities, TransferProgress, TransferStatus, TransferToken,
    UploadToken,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{Auditor, TracingAuditor, audit_once};
use crate::checksum::{ContentHasher, Sha256Hasher};
use crate::claims::{AllowAllClaims, ClaimsProvider};
use crate::codec::{BufferedBlockReader, BufferedBlockWriter};
use crate::config::{DEFAULT_EXPIRATION_SECS, TransferConfig};
use crate::provider::{StorageProvider, detect_content_type};
use crate::record::{ContentHandle, RecordState, TransferRecord};
use crate::scheduler::Scheduler;
use crate::store::{InMemoryTransferStore, TransferStore};
use crate::validation::resource_name;
use crate::window::ChunkStream;
use crate::{ErrorKind, VfsError};

/// Parameters of an upload token request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub resource_id: String,
    /// Announced size of the upload.
    pub resource_length: u64,
    /// Detected from the resource name when absent.
    pub content_type: Option<String>,
    /// Replace an existing file.
    pub overwrite: bool,
}

impl UploadRequest {
    pub fn new(resource_id: impl Into<String>, resource_length: u64) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_length,
            content_type: None,
            overwrite: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Parameters of a download token request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub resource_id: String,
    /// Configured download block size when absent.
    pub block_size: Option<u64>,
    /// Put the resource's content hash into the token.
    pub include_hash: bool,
}

impl DownloadRequest {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            block_size: None,
            include_hash: false,
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn include_hash(mut self, include_hash: bool) -> Self {
        self.include_hash = include_hash;
        self
    }
}

/// Content hashes of uploads finished by their last block, kept so a
/// following [`TransferHandler::complete`] can still verify them.
#[derive(Default)]
struct CompletedUploads {
    entries: Mutex<HashMap<String, CompletedUpload>>,
}

struct CompletedUpload {
    content_hash: String,
    retain_until: DateTime<Utc>,
}

impl CompletedUploads {
    fn insert(&self, transfer_id: &str, content_hash: String, retain_until: DateTime<Utc>) {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| entry.retain_until > now);
        entries.insert(
            transfer_id.to_string(),
            CompletedUpload {
                content_hash,
                retain_until,
            },
        );
    }

    /// Removes the entry of `transfer_id`, returning its hash unless it
    /// outlived its retention.
    fn take(&self, transfer_id: &str) -> Option<String> {
        let entry = self.entries.lock().unwrap().remove(transfer_id)?;
        (entry.retain_until > Utc::now()).then_some(entry.content_hash)
    }
}

struct HandlerInner {
    provider: Arc<dyn StorageProvider>,
    locks: Arc<LockRepository>,
    store: Arc<dyn TransferStore>,
    scheduler: Arc<dyn Scheduler>,
    claims: Arc<dyn ClaimsProvider>,
    auditor: Arc<dyn Auditor>,
    hasher: Arc<dyn ContentHasher>,
    config: TransferConfig,
    completed: CompletedUploads,
}

/// Builder for [`TransferHandler`].
pub struct TransferHandlerBuilder {
    provider: Arc<dyn StorageProvider>,
    scheduler: Arc<dyn Scheduler>,
    locks: Option<Arc<LockRepository>>,
    store: Option<Arc<dyn TransferStore>>,
    claims: Option<Arc<dyn ClaimsProvider>>,
    auditor: Option<Arc<dyn Auditor>>,
    hasher: Option<Arc<dyn ContentHasher>>,
    config: TransferConfig,
}

impl TransferHandlerBuilder {
    /// Shares a lock repository with other components.
    pub fn locks(mut self, locks: Arc<LockRepository>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn store(mut self, store: Arc<dyn TransferStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn claims(mut self, claims: Arc<dyn ClaimsProvider>) -> Self {
        self.claims = Some(claims);
        self
    }

    pub fn auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TransferHandler {
        TransferHandler {
            inner: Arc::new(HandlerInner {
                provider: self.provider,
                scheduler: self.scheduler,
                locks: self.locks.unwrap_or_default(),
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(InMemoryTransferStore::new())),
                claims: self.claims.unwrap_or_else(|| Arc::new(AllowAllClaims)),
                auditor: self.auditor.unwrap_or_else(|| Arc::new(TracingAuditor)),
                hasher: self.hasher.unwrap_or_else(|| Arc::new(Sha256Hasher)),
                config: self.config.clamped(),
                completed: CompletedUploads::default(),
            }),
        }
    }
}

/// Server side of block-based transfers.
///
/// Cheap to clone; clones share all state. Every terminal transition
/// (complete, cancel, expire) first removes the record from the
/// [`TransferStore`], so whichever caller wins that removal is the only one
/// that finishes the transfer. The others observe
/// [`TransferStatus::UnknownTransfer`].
#[derive(Clone)]
pub struct TransferHandler {
    inner: Arc<HandlerInner>,
}

impl TransferHandler {
    pub fn builder(
        provider: Arc<dyn StorageProvider>,
        scheduler: Arc<dyn Scheduler>,
    ) -> TransferHandlerBuilder {
        TransferHandlerBuilder {
            provider,
            scheduler,
            locks: None,
            store: None,
            claims: None,
            auditor: None,
            hasher: None,
            config: TransferConfig::default(),
        }
    }

    pub fn locks(&self) -> &Arc<LockRepository> {
        &self.inner.locks
    }

    pub fn store(&self) -> &Arc<dyn TransferStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Effective limits: the stricter of configuration and provider.
    pub fn get_capabilities(&self) -> TransferCapabilities {
        let provider = self.inner.provider.capabilities();
        let config = &self.inner.config;
        TransferCapabilities {
            max_block_size: provider.max_block_size.min(config.max_block_size),
            max_resource_size: match (provider.max_resource_size, config.max_upload_size) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            transmission: provider.transmission,
        }
    }

    pub fn request_upload_token(&self, request: UploadRequest) -> Result<UploadToken, VfsError> {
        self.audited("request_upload_token", self.issue_upload_token(request))
    }

    pub fn request_download_token(
        &self,
        request: DownloadRequest,
    ) -> Result<DownloadToken, VfsError> {
        self.audited("request_download_token", self.issue_download_token(request))
    }

    /// Returns the token of an active transfer.
    pub fn reload_token(&self, transfer_id: &str) -> Result<IssuedToken, VfsError> {
        let result = self.record(transfer_id).and_then(|record| {
            let token = record.token();
            if token.transfer().is_expired(Utc::now()) {
                return Err(VfsError::unknown_transfer(transfer_id));
            }
            Ok(token.clone())
        });
        self.audited("reload_token", result)
    }

    /// Status of a transfer; [`TransferStatus::UnknownTransfer`] once it
    /// reached a terminal state or never existed.
    pub fn get_status(&self, transfer_id: &str) -> TransferStatus {
        self.inner
            .store
            .get(transfer_id)
            .map_or(TransferStatus::UnknownTransfer, |r| r.status())
    }

    pub fn get_progress(&self, transfer_id: &str) -> Result<TransferProgress, VfsError> {
        let result = self.record(transfer_id).map(|r| r.progress());
        self.audited("get_progress", result)
    }

    /// Tokens of all registered transfers of a resource.
    pub fn active_transfers_for(&self, resource_id: &str) -> Vec<IssuedToken> {
        let id = self
            .inner
            .provider
            .resolve_id(resource_id)
            .unwrap_or_else(|_| resource_id.to_string());
        self.inner
            .store
            .active_for_resource(&id)
            .iter()
            .map(|r| r.token().clone())
            .collect()
    }

    /// Applies one upload block. A block marked last completes the transfer
    /// and yields the final status; a later [`complete`](Self::complete)
    /// with a content hash still verifies the committed upload.
    pub fn write_block(&self, block: BufferedDataBlock) -> Result<TransferStatus, VfsError> {
        let BufferedDataBlock { info, data } = block;
        let payload_len = data.len() as u64;
        let result = match info.block_length {
            Some(declared) if declared != payload_len => Err(VfsError::block_invalid(format!(
                "block {} declares {declared} bytes but carries {payload_len}",
                info.block_number
            ))),
            _ => self.apply_upload_block(info, &mut data.as_slice(), Some(payload_len), false),
        };
        self.audited("write_block", result)
    }

    /// Streamed variant of [`write_block`](Self::write_block). Without a
    /// declared length the payload is bounded by the maximum block size.
    pub fn write_block_streamed(
        &self,
        block: StreamedDataBlock,
    ) -> Result<TransferStatus, VfsError> {
        let StreamedDataBlock { info, mut data } = block;
        let declared = info.block_length;
        let result = self.apply_upload_block(info, &mut data, declared, true);
        self.audited("write_block_streamed", result)
    }

    /// Serves one download block. The block that leaves no other block
    /// unserved is marked last and completes the transfer.
    pub fn read_block(
        &self,
        transfer_id: &str,
        block_number: u64,
    ) -> Result<BufferedDataBlock, VfsError> {
        let result = self
            .serve_download_block(transfer_id, block_number, false)
            .and_then(|(info, payload)| {
                Ok(BufferedDataBlock {
                    info,
                    data: payload.into_bytes()?,
                })
            });
        self.audited("read_block", result)
    }

    pub fn read_block_streamed(
        &self,
        transfer_id: &str,
        block_number: u64,
    ) -> Result<StreamedDataBlock, VfsError> {
        let result = self
            .serve_download_block(transfer_id, block_number, true)
            .map(|(info, payload)| StreamedDataBlock::new(info, payload.into_reader()));
        self.audited("read_block_streamed", result)
    }

    /// Suspends an active transfer, releasing its open storage handle. The
    /// lock stays held.
    pub fn pause(&self, transfer_id: &str) -> Result<TransferStatus, VfsError> {
        let result = self.record(transfer_id).and_then(|record| {
            let mut state = record.state();
            if !state.status.accepts_blocks() {
                return Err(VfsError::status_invalid(format!(
                    "cannot pause transfer {transfer_id} while {:?}",
                    state.status
                )));
            }
            match &mut state.content {
                ContentHandle::Upload { staging } => {
                    if let Some(staging) = staging.as_mut() {
                        staging.suspend()?;
                    }
                }
                ContentHandle::Download { reader } => *reader = None,
            }
            state.status = TransferStatus::Paused;
            drop(state);
            self.inner.store.update(&record);
            debug!(transfer = %transfer_id, "transfer paused");
            Ok(TransferStatus::Paused)
        });
        self.audited("pause", result)
    }

    pub fn resume(&self, transfer_id: &str) -> Result<TransferStatus, VfsError> {
        let result = self.record(transfer_id).and_then(|record| {
            let mut state = record.state();
            if state.status != TransferStatus::Paused {
                return Err(VfsError::status_invalid(format!(
                    "cannot resume transfer {transfer_id} while {:?}",
                    state.status
                )));
            }
            state.status = TransferStatus::Running;
            drop(state);
            self.inner.store.update(&record);
            debug!(transfer = %transfer_id, "transfer resumed");
            Ok(TransferStatus::Running)
        });
        self.audited("resume", result)
    }

    /// Finishes a transfer, optionally verifying `content_hash` first.
    ///
    /// Uploads are committed to storage. A hash mismatch aborts the transfer
    /// with [`AbortReason::VerificationFailure`] and fails with
    /// [`ErrorKind::IntegrityCheckFailed`], as does an upload whose received
    /// bytes differ from the announced length.
    ///
    /// An upload already finished by its last block only has its hash
    /// checked, once. Completing any other transfer that is no longer
    /// registered is a no-op returning [`TransferStatus::UnknownTransfer`].
    pub fn complete(
        &self,
        transfer_id: &str,
        content_hash: Option<&str>,
    ) -> Result<TransferStatus, VfsError> {
        self.audited("complete", self.finish(transfer_id, content_hash, false))
    }

    /// Aborts a transfer and discards staged data. Returns
    /// [`TransferStatus::UnknownTransfer`] if it was no longer registered.
    pub fn cancel(&self, transfer_id: &str, reason: AbortReason) -> TransferStatus {
        let Some(record) = self.inner.store.remove(transfer_id) else {
            debug!(transfer = %transfer_id, "cancel ignored, transfer not registered");
            return TransferStatus::UnknownTransfer;
        };
        let mut state = record.state();
        self.abort(&record, &mut state, reason);
        TransferStatus::Aborted
    }

    /// Expiration job body. Returns `true` if this call aborted the
    /// transfer.
    pub(crate) fn expire(&self, transfer_id: &str) -> bool {
        let Some(record) = self.inner.store.remove(transfer_id) else {
            return false;
        };
        let mut state = record.state();
        // The job is running, there is nothing left to cancel.
        state.expiration_job = None;
        self.abort(&record, &mut state, AbortReason::Expired);
        true
    }

    /// Client-side writer turning a byte stream into upload blocks applied
    /// through this handler. Continues after the blocks already received.
    pub fn upload_writer(
        &self,
        token: &UploadToken,
    ) -> BufferedBlockWriter<impl FnMut(BufferedDataBlock) -> Result<(), VfsError> + Send + 'static>
    {
        let transfer_id = token.transfer.transfer_id.clone();
        let block_size = token
            .max_block_size
            .unwrap_or_else(|| self.get_capabilities().max_block_size);
        let threshold = self.inner.config.flush_threshold(block_size);
        let (block_number, offset) = self
            .inner
            .store
            .get(&transfer_id)
            .map_or((0, 0), |r| r.resume_point());

        let handler = self.clone();
        BufferedBlockWriter::resume_at(
            transfer_id,
            usize::try_from(block_size).unwrap_or(usize::MAX),
            usize::try_from(threshold).unwrap_or(usize::MAX),
            block_number,
            offset,
            move |block| handler.write_block(block).map(|_| ()),
        )
    }

    /// Client-side reader reassembling a download through this handler.
    pub fn download_reader(
        &self,
        token: &DownloadToken,
    ) -> BufferedBlockReader<impl FnMut(u64) -> Result<Option<BufferedDataBlock>, VfsError> + Send + 'static>
    {
        let transfer_id = token.transfer.transfer_id.clone();
        let total = token.total_block_count.unwrap_or(0);
        let handler = self.clone();
        BufferedBlockReader::new(move |block_number| {
            if block_number >= total {
                return Ok(None);
            }
            handler.read_block(&transfer_id, block_number).map(Some)
        })
    }

    /// Periodically drops idle lock trackers until the returned token is
    /// cancelled.
    pub fn spawn_lock_sweeper(&self, runtime: &Handle) -> CancellationToken {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let locks = Arc::clone(&self.inner.locks);
        let period = self.inner.config.lock_sweep_interval();
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        locks.prune();
                    }
                }
            }
            debug!("lock sweeper stopped");
        });
        stop
    }

    fn audited<T>(&self, context: &str, result: Result<T, VfsError>) -> Result<T, VfsError> {
        result.map_err(|mut err| {
            audit_once(self.inner.auditor.as_ref(), context, &mut err);
            err
        })
    }

    fn record(&self, transfer_id: &str) -> Result<Arc<TransferRecord>, VfsError> {
        self.inner
            .store
            .get(transfer_id)
            .ok_or_else(|| VfsError::unknown_transfer(transfer_id))
    }

    /// Transfer locks carry no timeout of their own. They live exactly as
    /// long as the record, which the expiration job aborts.
    fn lock_resource(&self, resource_id: &str, lock_type: LockType) -> Result<LockGuard, VfsError> {
        let ancestors = self.inner.provider.ancestors(resource_id)?;
        let guard =
            self.inner
                .locks
                .acquire_with_ancestors(resource_id, lock_type, &ancestors, None);
        if !guard.is_lock_enabled() {
            return Err(VfsError::locked(resource_id));
        }
        Ok(guard)
    }

    fn new_transfer_token(
        &self,
        resource_id: String,
        resource_name: String,
        resource_length: u64,
        content_type: String,
    ) -> TransferToken {
        let created = Utc::now();
        let expiration = self
            .inner
            .config
            .transfer_expiration()
            .and_then(|d| TimeDelta::from_std(d).ok())
            .map(|d| created + d);
        TransferToken {
            transfer_id: Uuid::new_v4().to_string(),
            resource_id,
            resource_name,
            resource_length,
            content_type,
            created,
            expiration,
        }
    }

    /// Stores the record and arms its expiration job.
    fn register(&self, record: Arc<TransferRecord>) {
        self.inner.store.add(Arc::clone(&record));
        if let Some(expiration) = record.token().transfer().expiration {
            let handler: Weak<HandlerInner> = Arc::downgrade(&self.inner);
            let transfer_id = record.transfer_id().to_string();
            let job = self.inner.scheduler.schedule_once(
                expiration,
                Box::new(move || {
                    if let Some(inner) = handler.upgrade() {
                        if (TransferHandler { inner }).expire(&transfer_id) {
                            info!(transfer = %transfer_id, "transfer expired");
                        }
                    }
                }),
            );
            record.set_expiration_job(job);
        }
    }

    fn issue_upload_token(&self, request: UploadRequest) -> Result<UploadToken, VfsError> {
        let inner = &self.inner;
        let resource_id = inner.provider.resolve_id(&request.resource_id)?;
        let capabilities = self.get_capabilities();

        if let Some(max) = capabilities.max_resource_size {
            if request.resource_length > max {
                return Err(VfsError::new(
                    ErrorKind::ResourceAccess,
                    format!(
                        "upload of {} bytes exceeds the limit of {max} bytes",
                        request.resource_length
                    ),
                ));
            }
        }

        if let Some(existing) = inner.provider.resource_info(&resource_id)? {
            if existing.is_folder || !request.overwrite {
                return Err(VfsError::overwrite_conflict(&resource_id));
            }
            if !inner.claims.claims(&resource_id).allow_overwrite {
                return Err(VfsError::access_denied(format!(
                    "overwriting {resource_id} is not permitted"
                )));
            }
        }

        let guard = self.lock_resource(&resource_id, LockType::Write)?;

        let name = resource_name(&resource_id).to_string();
        let content_type = request
            .content_type
            .unwrap_or_else(|| detect_content_type(&name).to_string());
        let token = UploadToken {
            transfer: self.new_transfer_token(
                resource_id,
                name,
                request.resource_length,
                content_type,
            ),
            max_resource_size: capabilities.max_resource_size,
            max_block_size: Some(capabilities.max_block_size),
        };

        let staging = inner.provider.create_staging(&token)?;
        let record = Arc::new(TransferRecord::new(
            IssuedToken::Upload(token.clone()),
            guard,
            ContentHandle::Upload {
                staging: Some(staging),
            },
        ));
        self.register(record);

        info!(
            transfer = %token.transfer.transfer_id,
            resource = %token.transfer.resource_id,
            length = token.transfer.resource_length,
            "upload token issued"
        );
        Ok(token)
    }

    fn issue_download_token(&self, request: DownloadRequest) -> Result<DownloadToken, VfsError> {
        let inner = &self.inner;
        let resource_id = inner.provider.resolve_id(&request.resource_id)?;
        let info = inner
            .provider
            .resource_info(&resource_id)?
            .ok_or_else(|| VfsError::not_found(&resource_id))?;
        if info.is_folder {
            return Err(VfsError::new(
                ErrorKind::ResourceNotFound,
                format!("{resource_id} is a folder"),
            ));
        }
        if !inner.claims.claims(&resource_id).allow_read {
            return Err(VfsError::access_denied(format!(
                "reading {resource_id} is not permitted"
            )));
        }

        let max_block_size = self.get_capabilities().max_block_size;
        let block_size = request
            .block_size
            .unwrap_or_else(|| inner.config.download_block_size.min(max_block_size));
        if block_size == 0 || block_size > max_block_size {
            return Err(VfsError::block_invalid(format!(
                "block size {block_size} outside 1..={max_block_size}"
            )));
        }

        let guard = self.lock_resource(&resource_id, LockType::Read)?;

        let content_hash = if request.include_hash {
            let mut reader = inner.provider.open_read(&resource_id)?;
            Some(inner.hasher.hash(&mut reader)?)
        } else {
            None
        };

        let token = DownloadToken {
            transfer: self.new_transfer_token(
                resource_id,
                info.name,
                info.length,
                info.content_type,
            ),
            content_hash,
            block_size: Some(block_size),
            total_block_count: Some(info.length.div_ceil(block_size).max(1)),
        };

        let record = Arc::new(TransferRecord::new(
            IssuedToken::Download(token.clone()),
            guard,
            ContentHandle::Download { reader: None },
        ));
        self.register(record);

        info!(
            transfer = %token.transfer.transfer_id,
            resource = %token.transfer.resource_id,
            length = token.transfer.resource_length,
            block_size,
            "download token issued"
        );
        Ok(token)
    }

    fn apply_upload_block(
        &self,
        mut info: DataBlockInfo,
        data: &mut dyn Read,
        declared: Option<u64>,
        streamed: bool,
    ) -> Result<TransferStatus, VfsError> {
        let transfer_id = info.transfer_id.clone();
        let record = self.record(&transfer_id)?;
        let IssuedToken::Upload(token) = record.token() else {
            return Err(VfsError::status_invalid(format!(
                "transfer {transfer_id} is a download"
            )));
        };
        let capabilities = self.get_capabilities();
        if streamed && !capabilities.transmission.streamed_blocks {
            return Err(VfsError::block_invalid("streamed blocks are not supported"));
        }

        let block_number = info.block_number;
        let max_block_size = token.max_block_size.unwrap_or(capabilities.max_block_size);
        let mut limit = declared.unwrap_or(max_block_size);
        if limit > max_block_size {
            return Err(VfsError::block_invalid(format!(
                "block {block_number} of {limit} bytes exceeds the maximum of {max_block_size}"
            )));
        }
        if declared == Some(0) && !info.is_last_block {
            return Err(VfsError::block_invalid(format!(
                "block {block_number} is empty but not the last block"
            )));
        }
        let length = token.transfer.resource_length;
        let room = length.checked_sub(info.offset).ok_or_else(|| {
            VfsError::block_invalid(format!(
                "block {block_number} starts at offset {} past the announced length of {length}",
                info.offset
            ))
        })?;
        if declared.is_some_and(|len| len > room) {
            return Err(VfsError::block_invalid(format!(
                "block {block_number} extends past the announced length of {length}"
            )));
        }
        limit = limit.min(room);

        let is_last = info.is_last_block;
        {
            let mut state = record.state();
            check_accepts_blocks(&state, &transfer_id)?;
            if capabilities.transmission.sequential_blocks_required
                && !state.is_in_sequence(block_number)
            {
                return Err(VfsError::block_invalid(format!(
                    "block {block_number} is out of sequence"
                )));
            }

            let ContentHandle::Upload {
                staging: Some(staging),
            } = &mut state.content
            else {
                return Err(VfsError::status_invalid(format!(
                    "transfer {transfer_id} has no staging area"
                )));
            };
            let written = staging.write_at(info.offset, limit, data)?;
            if let Some(len) = declared {
                if written != len {
                    return Err(VfsError::block_invalid(format!(
                        "block {block_number} carried {written} of {len} declared bytes"
                    )));
                }
            }

            info.block_length = Some(written);
            debug!(
                transfer = %transfer_id,
                block = block_number,
                offset = info.offset,
                length = written,
                "block written"
            );
            state.register_block(info);
        }
        self.inner.store.update(&record);

        if is_last {
            return self.finish(&transfer_id, None, true);
        }
        Ok(TransferStatus::Running)
    }

    fn serve_download_block(
        &self,
        transfer_id: &str,
        block_number: u64,
        streamed: bool,
    ) -> Result<(DataBlockInfo, BlockPayload), VfsError> {
        let record = self.record(transfer_id)?;
        let IssuedToken::Download(token) = record.token() else {
            return Err(VfsError::status_invalid(format!(
                "transfer {transfer_id} is an upload"
            )));
        };
        let capabilities = self.get_capabilities();
        if streamed && !capabilities.transmission.streamed_blocks {
            return Err(VfsError::block_invalid("streamed blocks are not supported"));
        }

        let block_size = token
            .block_size
            .unwrap_or(self.inner.config.download_block_size);
        let total = token.total_block_count.unwrap_or(1);
        if block_number >= total {
            return Err(VfsError::block_invalid(format!(
                "block {block_number} out of range, transfer has {total} blocks"
            )));
        }
        let offset = block_number * block_size;
        let length = block_size.min(token.transfer.resource_length.saturating_sub(offset));
        let mut info = DataBlockInfo {
            transfer_id: transfer_id.to_string(),
            block_number,
            block_length: Some(length),
            offset,
            is_last_block: false,
        };

        let payload = {
            let mut state = record.state();
            check_accepts_blocks(&state, transfer_id)?;
            if !capabilities.transmission.random_block_reads && !state.is_in_sequence(block_number)
            {
                return Err(VfsError::block_invalid(format!(
                    "block {block_number} is out of sequence"
                )));
            }

            let payload = if streamed {
                let source = self.inner.provider.open_read(record.resource_id())?;
                BlockPayload::Streamed(Box::new(ChunkStream::new(source, offset, length)))
            } else {
                let ContentHandle::Download { reader } = &mut state.content else {
                    return Err(VfsError::status_invalid(format!(
                        "transfer {transfer_id} has no reader"
                    )));
                };
                let source = match reader.take() {
                    Some(source) => source,
                    None => self.inner.provider.open_read(record.resource_id())?,
                };
                let source = reader.insert(source);
                let mut data = Vec::with_capacity(usize::try_from(length).unwrap_or(0));
                ChunkStream::new(source, offset, length).read_to_end(&mut data)?;
                if data.len() as u64 != length {
                    return Err(VfsError::new(
                        ErrorKind::ResourceAccess,
                        format!(
                            "{} changed during download, read {} of {length} bytes at offset {offset}",
                            record.resource_id(),
                            data.len()
                        ),
                    ));
                }
                BlockPayload::Buffered(data)
            };
            let unserved = total - state.blocks.len() as u64;
            info.is_last_block = unserved == 1 && !state.blocks.contains_key(&block_number);
            state.register_block(info.clone());
            payload
        };
        self.inner.store.update(&record);
        debug!(transfer = %transfer_id, block = block_number, offset, length, "block served");

        if info.is_last_block {
            self.finish(transfer_id, None, false)?;
        }
        Ok((info, payload))
    }

    /// Terminal transition to `Completed`. With `retain_hash`, an upload's
    /// content hash is kept for a later [`complete`](Self::complete).
    fn finish(
        &self,
        transfer_id: &str,
        content_hash: Option<&str>,
        retain_hash: bool,
    ) -> Result<TransferStatus, VfsError> {
        let Some(record) = self.inner.store.remove(transfer_id) else {
            return self.confirm_completed(transfer_id, content_hash);
        };
        let mut state = record.state();
        self.cancel_expiration(&mut state);

        let expected_length = record.token().transfer().resource_length;
        if record.is_upload() && state.transferred_bytes != expected_length {
            warn!(
                transfer = %transfer_id,
                expected = expected_length,
                received = state.transferred_bytes,
                "upload length mismatch"
            );
            self.abort(&record, &mut state, AbortReason::VerificationFailure);
            return Err(VfsError::new(
                ErrorKind::IntegrityCheckFailed,
                format!(
                    "transfer {transfer_id} received {} of {expected_length} announced bytes",
                    state.transferred_bytes
                ),
            ));
        }

        let retained = retain_hash && record.is_upload();
        let mut actual_hash = None;
        if content_hash.is_some() || retained {
            let actual = match self.content_hash(&record, &mut state) {
                Ok(actual) => actual,
                Err(err) => {
                    self.abort(&record, &mut state, AbortReason::ServerError);
                    return Err(err);
                }
            };
            if let Some(expected) = content_hash {
                if !self.inner.hasher.matches(expected, &actual) {
                    warn!(
                        transfer = %transfer_id,
                        expected = %expected,
                        actual = %actual,
                        "content hash mismatch"
                    );
                    self.abort(&record, &mut state, AbortReason::VerificationFailure);
                    return Err(VfsError::integrity(transfer_id));
                }
            }
            actual_hash = Some(actual);
        }

        let staging = match &mut state.content {
            ContentHandle::Upload { staging } => staging.take(),
            ContentHandle::Download { reader } => {
                *reader = None;
                None
            }
        };
        if let Some(staging) = staging {
            if let Err(err) = staging.commit() {
                self.abort(&record, &mut state, AbortReason::ServerError);
                return Err(err);
            }
        }

        state.status = TransferStatus::Completed;
        state.lock = None;
        if let Some(hash) = actual_hash.filter(|_| retained) {
            self.inner
                .completed
                .insert(transfer_id, hash, self.completion_retention());
        }
        info!(
            transfer = %transfer_id,
            resource = %record.resource_id(),
            bytes = state.transferred_bytes,
            "transfer completed"
        );
        Ok(TransferStatus::Completed)
    }

    /// `complete` of an upload its last block already finished.
    fn confirm_completed(
        &self,
        transfer_id: &str,
        content_hash: Option<&str>,
    ) -> Result<TransferStatus, VfsError> {
        let Some(actual) = self.inner.completed.take(transfer_id) else {
            debug!(transfer = %transfer_id, "complete ignored, transfer not registered");
            return Ok(TransferStatus::UnknownTransfer);
        };
        if let Some(expected) = content_hash {
            if !self.inner.hasher.matches(expected, &actual) {
                warn!(
                    transfer = %transfer_id,
                    expected = %expected,
                    actual = %actual,
                    "content hash mismatch on completed upload"
                );
                return Err(VfsError::integrity(transfer_id));
            }
        }
        Ok(TransferStatus::Completed)
    }

    fn completion_retention(&self) -> DateTime<Utc> {
        let retention = self
            .inner
            .config
            .transfer_expiration()
            .unwrap_or(Duration::from_secs(DEFAULT_EXPIRATION_SECS));
        TimeDelta::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn content_hash(
        &self,
        record: &TransferRecord,
        state: &mut RecordState,
    ) -> Result<String, VfsError> {
        let mut reader = match &mut state.content {
            ContentHandle::Upload {
                staging: Some(staging),
            } => staging.open_staged()?,
            ContentHandle::Upload { staging: None } => {
                return Err(VfsError::status_invalid(format!(
                    "transfer {} has no staged data",
                    record.transfer_id()
                )));
            }
            ContentHandle::Download { .. } => self.inner.provider.open_read(record.resource_id())?,
        };
        Ok(self.inner.hasher.hash(&mut reader)?)
    }

    fn cancel_expiration(&self, state: &mut RecordState) {
        if let Some(job) = state.expiration_job.take() {
            self.inner.scheduler.cancel(&job);
        }
    }

    /// Moves a removed record to `Aborted`, discarding staged data and
    /// releasing its locks.
    fn abort(&self, record: &TransferRecord, state: &mut RecordState, reason: AbortReason) {
        self.cancel_expiration(state);
        match &mut state.content {
            ContentHandle::Upload { staging } => {
                if let Some(staging) = staging.take() {
                    if let Err(err) = staging.discard() {
                        warn!(
                            transfer = %record.transfer_id(),
                            error = %err,
                            "failed to discard staged data"
                        );
                    }
                }
            }
            ContentHandle::Download { reader } => *reader = None,
        }
        state.status = TransferStatus::Aborted;
        state.abort_reason = Some(reason);
        state.lock = None;
        info!(
            transfer = %record.transfer_id(),
            resource = %record.resource_id(),
            %reason,
            "transfer aborted"
        );
    }
}

enum BlockPayload {
    Buffered(Vec<u8>),
    Streamed(Box<dyn Read + Send>),
}

impl BlockPayload {
    fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Buffered(data) => Ok(data),
            Self::Streamed(mut reader) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            Self::Buffered(data) => Box::new(io::Cursor::new(data)),
            Self::Streamed(reader) => reader,
        }
    }
}

fn check_accepts_blocks(state: &RecordState, transfer_id: &str) -> Result<(), VfsError> {
    if !state.status.accepts_blocks() {
        return Err(VfsError::status_invalid(format!(
            "transfer {transfer_id} does not accept blocks while {:?}",
            state.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use crate::claims::ResourceClaims;
    use crate::scheduler::TokioScheduler;
    use crate::testing::{ManualScheduler, MemoryProvider, RecordingAuditor};
    use std::io::{Cursor, Write};
    use std::thread;
    use tessera_lock::ResourceLockState;
    use tessera_protocol::TransmissionCapabilities;

    struct Fixture {
        provider: Arc<MemoryProvider>,
        scheduler: Arc<ManualScheduler>,
        auditor: Arc<RecordingAuditor>,
        locks: Arc<LockRepository>,
        handler: TransferHandler,
    }

    fn config() -> TransferConfig {
        TransferConfig {
            max_block_size: 3000,
            download_block_size: 3000,
            ..TransferConfig::default()
        }
    }

    fn fixture_with(provider: Arc<MemoryProvider>, config: TransferConfig) -> Fixture {
        let scheduler = ManualScheduler::new();
        let auditor = RecordingAuditor::new();
        let locks = Arc::new(LockRepository::new());
        let handler = TransferHandler::builder(provider.clone(), scheduler.clone())
            .locks(Arc::clone(&locks))
            .auditor(auditor.clone())
            .config(config)
            .build();
        Fixture {
            provider,
            scheduler,
            auditor,
            locks,
            handler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryProvider::new(), config())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn upload(f: &Fixture, resource_id: &str, length: u64) -> String {
        f.handler
            .request_upload_token(UploadRequest::new(resource_id, length))
            .unwrap()
            .transfer
            .transfer_id
    }

    fn block(id: &str, number: u64, data: &[u8], last: bool) -> BufferedDataBlock {
        BufferedDataBlock::new(id, number, number * 3000, data.to_vec(), last)
    }

    struct ReadOnly;

    impl ClaimsProvider for ReadOnly {
        fn claims(&self, _resource_id: &str) -> ResourceClaims {
            ResourceClaims::READ_ONLY
        }
    }

    #[test]
    fn upload_in_four_blocks_completes_on_last_block() {
        let f = fixture();
        f.provider.add_folder("docs");
        let data = pattern(10_000);
        let token = f
            .handler
            .request_upload_token(UploadRequest::new("docs/report.bin", 10_000))
            .unwrap();
        let id = token.transfer.transfer_id.clone();
        assert_eq!(token.max_block_size, Some(3000));
        assert_eq!(token.transfer.resource_name, "report.bin");
        assert_eq!(f.locks.lock_state("docs/report.bin"), ResourceLockState::Locked);
        assert_eq!(f.locks.lock_state("docs"), ResourceLockState::ReadOnly);
        assert_eq!(f.handler.get_status(&id), TransferStatus::Starting);

        for (n, chunk) in data.chunks(3000).enumerate() {
            let last = n == 3;
            let status = f
                .handler
                .write_block(block(&id, n as u64, chunk, last))
                .unwrap();
            let expected = if last {
                TransferStatus::Completed
            } else {
                TransferStatus::Running
            };
            assert_eq!(status, expected);
        }

        assert_eq!(
            f.provider.writes(),
            [(0, 3000), (3000, 3000), (6000, 3000), (9000, 1000)]
        );
        assert_eq!(f.provider.file("docs/report.bin").unwrap(), data);
        assert_eq!(f.handler.get_status(&id), TransferStatus::UnknownTransfer);
        assert_eq!(f.locks.lock_state("docs/report.bin"), ResourceLockState::Unlocked);
        assert_eq!(f.locks.lock_state("docs"), ResourceLockState::Unlocked);
        assert_eq!(f.scheduler.pending(), 0);

        // The last block committed the upload; its hash is still checked.
        let status = f
            .handler
            .complete(&id, Some(&checksum_bytes(&data)))
            .unwrap();
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(
            f.handler.complete(&id, None).unwrap(),
            TransferStatus::UnknownTransfer
        );
        assert!(f.auditor.incidents().is_empty());
    }

    #[test]
    fn hash_of_upload_finished_by_last_block_is_verified() {
        let f = fixture();
        let data = pattern(10_000);
        let id = upload(&f, "report.bin", 10_000);
        for (n, chunk) in data.chunks(3000).enumerate() {
            f.handler
                .write_block(block(&id, n as u64, chunk, n == 3))
                .unwrap();
        }

        let err = f.handler.complete(&id, Some("deadbeef")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityCheckFailed);
        assert!(err.is_audited());
        assert_eq!(f.auditor.incidents()[0].context, "complete");
        assert_eq!(
            f.handler.complete(&id, Some(&checksum_bytes(&data))).unwrap(),
            TransferStatus::UnknownTransfer
        );
    }

    #[test]
    fn short_upload_cannot_complete() {
        let f = fixture();
        let id = upload(&f, "short.bin", 10_000);
        let record = f.handler.store().get(&id).unwrap();

        let err = f
            .handler
            .write_block(block(&id, 0, &pattern(3000), true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityCheckFailed);
        assert_eq!(record.status(), TransferStatus::Aborted);
        assert_eq!(record.abort_reason(), Some(AbortReason::VerificationFailure));
        assert_eq!(f.provider.discarded(), 1);
        assert!(f.provider.file("short.bin").is_none());
        assert_eq!(f.locks.lock_state("short.bin"), ResourceLockState::Unlocked);
    }

    #[test]
    fn blocks_past_announced_length_are_rejected() {
        let f = fixture();
        let id = upload(&f, "small.bin", 1000);

        let err = f
            .handler
            .write_block(block(&id, 0, &pattern(3000), true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);
        let beyond = BufferedDataBlock::new(&id, 0, 1200, b"x".to_vec(), true);
        let err = f.handler.write_block(beyond).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);
        assert!(f.provider.writes().is_empty());

        let status = f
            .handler
            .write_block(block(&id, 0, &pattern(1000), true))
            .unwrap();
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(f.provider.file("small.bin").unwrap().len(), 1000);
    }

    #[test]
    fn explicit_complete_verifies_hash() {
        let f = fixture();
        let data = pattern(10_000);
        let id = upload(&f, "report.bin", 10_000);
        for (n, chunk) in data.chunks(3000).enumerate() {
            f.handler.write_block(block(&id, n as u64, chunk, false)).unwrap();
        }
        let record = f.handler.store().get(&id).unwrap();

        let status = f
            .handler
            .complete(&id, Some(&checksum_bytes(&data).to_uppercase()))
            .unwrap();
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(record.status(), TransferStatus::Completed);
        assert!(!record.holds_lock());
        assert_eq!(f.provider.file("report.bin").unwrap(), data);
    }

    #[test]
    fn hash_mismatch_aborts_and_discards() {
        let f = fixture();
        let id = upload(&f, "report.bin", 100);
        f.handler.write_block(block(&id, 0, &pattern(100), false)).unwrap();
        let record = f.handler.store().get(&id).unwrap();

        let err = f.handler.complete(&id, Some("deadbeef")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityCheckFailed);
        assert!(err.is_audited());
        assert_eq!(record.status(), TransferStatus::Aborted);
        assert_eq!(record.abort_reason(), Some(AbortReason::VerificationFailure));
        assert_eq!(f.provider.discarded(), 1);
        assert!(f.provider.file("report.bin").is_none());
        assert_eq!(f.locks.lock_state("report.bin"), ResourceLockState::Unlocked);

        let incidents = f.auditor.incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].context, "complete");
        assert_eq!(incidents[0].event, "integrity_check_failed");
    }

    #[test]
    fn locked_resources_are_refused() {
        let f = fixture();
        f.provider.add_file("a.txt", b"old");
        upload(&f, "a.txt", 3);

        let err = f
            .handler
            .request_upload_token(UploadRequest::new("a.txt", 3).overwrite(true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLocked);
        let err = f
            .handler
            .request_download_token(DownloadRequest::new("a.txt"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLocked);
    }

    #[test]
    fn ancestors_stay_read_locked_during_upload() {
        let f = fixture();
        f.provider.add_folder("docs");
        let id = upload(&f, "docs/sub/a.txt", 3);
        assert!(!f.locks.try_write_lock("docs", None).is_enabled());
        assert!(!f.locks.try_write_lock("docs/sub", None).is_enabled());

        f.handler.cancel(&id, AbortReason::ClientAbort);
        let lock = f.locks.try_write_lock("docs", None);
        assert!(lock.is_enabled());
        f.locks.release(&lock);
    }

    #[test]
    fn existing_resources_need_overwrite_and_claims() {
        let f = fixture();
        f.provider.add_file("a.txt", b"old");
        f.provider.add_folder("docs");

        let err = f
            .handler
            .request_upload_token(UploadRequest::new("a.txt", 3))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceOverwriteConflict);
        let err = f
            .handler
            .request_upload_token(UploadRequest::new("docs", 3).overwrite(true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceOverwriteConflict);

        let guarded = TransferHandler::builder(f.provider.clone(), f.scheduler.clone())
            .claims(Arc::new(ReadOnly))
            .build();
        let err = guarded
            .request_upload_token(UploadRequest::new("a.txt", 3).overwrite(true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccessDenied);
        assert!(guarded
            .request_download_token(DownloadRequest::new("a.txt"))
            .is_ok());
    }

    #[test]
    fn upload_size_limit() {
        let f = fixture_with(
            MemoryProvider::new(),
            TransferConfig {
                max_upload_size: Some(5000),
                ..config()
            },
        );
        assert_eq!(f.handler.get_capabilities().max_resource_size, Some(5000));

        let err = f
            .handler
            .request_upload_token(UploadRequest::new("big.bin", 10_000))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceAccess);

        let id = upload(&f, "ok.bin", 4000);
        f.handler.write_block(block(&id, 0, &pattern(3000), false)).unwrap();
        let err = f
            .handler
            .write_block(block(&id, 1, &pattern(3000), false))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);
    }

    #[test]
    fn invalid_blocks_are_rejected() {
        let f = fixture();
        let id = upload(&f, "a.bin", 10_000);

        let err = f
            .handler
            .write_block(block(&id, 0, &pattern(3001), false))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);

        let mut mismatched = block(&id, 0, &pattern(10), false);
        mismatched.info.block_length = Some(20);
        let err = f.handler.write_block(mismatched).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);

        let err = f.handler.write_block(block(&id, 0, &[], false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);

        let err = f
            .handler
            .write_block(block("missing", 0, b"x", false))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTransfer);
        assert!(f.provider.writes().is_empty());
    }

    #[test]
    fn sequential_backends_reject_gaps() {
        let f = fixture();
        let id = upload(&f, "a.bin", 9000);

        let err = f
            .handler
            .write_block(block(&id, 1, &pattern(3000), false))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);

        f.handler.write_block(block(&id, 0, &pattern(3000), false)).unwrap();
        // A retry of the latest block is accepted and replaces it.
        f.handler.write_block(block(&id, 0, &pattern(3000), false)).unwrap();
        f.handler.write_block(block(&id, 1, &pattern(3000), false)).unwrap();
        let progress = f.handler.get_progress(&id).unwrap();
        assert_eq!(progress.transferred_bytes, 6000);
        assert_eq!(progress.block_count, 2);
        assert_eq!(progress.total_bytes, 9000);
    }

    #[test]
    fn random_order_when_backend_allows_it() {
        let provider = MemoryProvider::with_transmission(TransmissionCapabilities {
            sequential_blocks_required: false,
            random_block_reads: true,
            streamed_blocks: true,
        });
        let f = fixture_with(provider, config());
        let data = pattern(6000);
        let id = upload(&f, "a.bin", 6000);

        f.handler.write_block(block(&id, 1, &data[3000..], false)).unwrap();
        f.handler.write_block(block(&id, 0, &data[..3000], false)).unwrap();
        f.handler.complete(&id, Some(&checksum_bytes(&data))).unwrap();
        assert_eq!(f.provider.file("a.bin").unwrap(), data);
    }

    #[test]
    fn pause_and_resume() {
        let f = fixture();
        let id = upload(&f, "a.bin", 6000);
        f.handler.write_block(block(&id, 0, &pattern(3000), false)).unwrap();

        assert_eq!(f.handler.pause(&id).unwrap(), TransferStatus::Paused);
        assert_eq!(f.handler.get_status(&id), TransferStatus::Paused);
        let err = f
            .handler
            .write_block(block(&id, 1, &pattern(3000), false))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferStatusInvalid);
        assert_eq!(
            f.handler.pause(&id).unwrap_err().kind(),
            ErrorKind::TransferStatusInvalid
        );
        assert_eq!(f.locks.lock_state("a.bin"), ResourceLockState::Locked);

        assert_eq!(f.handler.resume(&id).unwrap(), TransferStatus::Running);
        assert_eq!(
            f.handler.resume(&id).unwrap_err().kind(),
            ErrorKind::TransferStatusInvalid
        );
        f.handler.write_block(block(&id, 1, &pattern(3000), true)).unwrap();
        assert_eq!(f.provider.file("a.bin").unwrap().len(), 6000);

        assert_eq!(
            f.handler.pause("missing").unwrap_err().kind(),
            ErrorKind::UnknownTransfer
        );
    }

    #[test]
    fn download_round_trip() {
        let f = fixture();
        let data = pattern(7000);
        f.provider.add_file("a.bin", &data);

        let token = f
            .handler
            .request_download_token(DownloadRequest::new("a.bin").include_hash(true))
            .unwrap();
        assert_eq!(token.block_size, Some(3000));
        assert_eq!(token.total_block_count, Some(3));
        assert_eq!(token.content_hash.as_deref(), Some(checksum_bytes(&data).as_str()));
        assert_eq!(f.locks.lock_state("a.bin"), ResourceLockState::ReadOnly);

        let mut reader = f.handler.download_reader(&token);
        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received, data);
        assert_eq!(reader.blocks_read(), 3);
        assert_eq!(
            f.handler.get_status(&token.transfer.transfer_id),
            TransferStatus::UnknownTransfer
        );
        assert_eq!(f.locks.lock_state("a.bin"), ResourceLockState::Unlocked);
    }

    #[test]
    fn concurrent_downloads_share_read_lock() {
        let f = fixture();
        f.provider.add_file("a.bin", b"hello");
        let first = f
            .handler
            .request_download_token(DownloadRequest::new("a.bin"))
            .unwrap();
        f.handler
            .request_download_token(DownloadRequest::new("a.bin"))
            .unwrap();
        assert_eq!(f.handler.active_transfers_for("a.bin").len(), 2);

        let err = f
            .handler
            .request_upload_token(UploadRequest::new("a.bin", 5).overwrite(true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLocked);

        let block = f.handler.read_block(&first.transfer.transfer_id, 0).unwrap();
        assert_eq!(block.data, b"hello");
        assert!(block.info.is_last_block);
        assert_eq!(f.handler.active_transfers_for("a.bin").len(), 1);
    }

    #[test]
    fn download_requests_are_validated() {
        let f = fixture();
        f.provider.add_file("a.bin", &pattern(10));
        f.provider.add_folder("docs");

        let err = f
            .handler
            .request_download_token(DownloadRequest::new("missing.bin"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
        let err = f
            .handler
            .request_download_token(DownloadRequest::new("docs"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
        for size in [0, 3001] {
            let err = f
                .handler
                .request_download_token(DownloadRequest::new("a.bin").block_size(size))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);
        }
        assert_eq!(f.locks.lock_state("a.bin"), ResourceLockState::Unlocked);
    }

    #[test]
    fn download_blocks_in_random_order() {
        let f = fixture();
        let data = pattern(2500);
        f.provider.add_file("a.bin", &data);
        let token = f
            .handler
            .request_download_token(DownloadRequest::new("a.bin").block_size(1000))
            .unwrap();
        let id = token.transfer.transfer_id;

        let b1 = f.handler.read_block(&id, 1).unwrap();
        assert_eq!(b1.data, &data[1000..2000]);
        assert_eq!(b1.info.offset, 1000);
        let b0 = f.handler.read_block(&id, 0).unwrap();
        assert_eq!(b0.data, &data[..1000]);
        let err = f.handler.read_block(&id, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);

        let b2 = f.handler.read_block(&id, 2).unwrap();
        assert_eq!(b2.data, &data[2000..]);
        assert!(b2.info.is_last_block);
        assert_eq!(f.handler.get_status(&id), TransferStatus::UnknownTransfer);
    }

    #[test]
    fn download_reading_highest_block_first_keeps_others_readable() {
        let f = fixture();
        let data = pattern(2500);
        f.provider.add_file("a.bin", &data);
        let token = f
            .handler
            .request_download_token(DownloadRequest::new("a.bin").block_size(1000))
            .unwrap();
        let id = token.transfer.transfer_id;

        let b2 = f.handler.read_block(&id, 2).unwrap();
        assert_eq!(b2.data, &data[2000..]);
        assert!(!b2.info.is_last_block);
        assert_eq!(f.handler.get_status(&id), TransferStatus::Running);

        // Serving a block twice does not count towards completion.
        assert!(!f.handler.read_block(&id, 2).unwrap().info.is_last_block);
        assert!(!f.handler.read_block(&id, 0).unwrap().info.is_last_block);
        assert_eq!(f.locks.lock_state("a.bin"), ResourceLockState::ReadOnly);

        let b1 = f.handler.read_block(&id, 1).unwrap();
        assert_eq!(b1.data, &data[1000..2000]);
        assert!(b1.info.is_last_block);
        assert_eq!(f.handler.get_status(&id), TransferStatus::UnknownTransfer);
        assert_eq!(f.locks.lock_state("a.bin"), ResourceLockState::Unlocked);
    }

    #[test]
    fn download_sequence_enforced_without_random_reads() {
        let provider = MemoryProvider::with_transmission(TransmissionCapabilities {
            sequential_blocks_required: true,
            random_block_reads: false,
            streamed_blocks: false,
        });
        let f = fixture_with(provider, config());
        f.provider.add_file("a.bin", &pattern(2500));
        let token = f
            .handler
            .request_download_token(DownloadRequest::new("a.bin").block_size(1000))
            .unwrap();
        let id = token.transfer.transfer_id;

        let err = f.handler.read_block(&id, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);
        f.handler.read_block(&id, 0).unwrap();
        f.handler.read_block(&id, 0).unwrap();
        f.handler.read_block(&id, 1).unwrap();

        let err = f.handler.read_block_streamed(&id, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);
    }

    #[test]
    fn empty_resource_downloads_as_one_empty_block() {
        let f = fixture();
        f.provider.add_file("empty.txt", b"");
        let token = f
            .handler
            .request_download_token(DownloadRequest::new("empty.txt"))
            .unwrap();
        assert_eq!(token.total_block_count, Some(1));

        let block = f.handler.read_block(&token.transfer.transfer_id, 0).unwrap();
        assert!(block.data.is_empty());
        assert!(block.info.is_last_block);
        assert_eq!(f.locks.lock_state("empty.txt"), ResourceLockState::Unlocked);
    }

    #[test]
    fn streamed_blocks_both_ways() {
        let f = fixture();
        let data = pattern(5000);
        let id = upload(&f, "s.bin", 5000);

        let info = |number: u64, offset: u64, length: Option<u64>, last: bool| DataBlockInfo {
            transfer_id: id.clone(),
            block_number: number,
            block_length: length,
            offset,
            is_last_block: last,
        };
        let first = StreamedDataBlock::new(
            info(0, 0, Some(3000), false),
            Box::new(Cursor::new(data[..3000].to_vec())),
        );
        assert_eq!(
            f.handler.write_block_streamed(first).unwrap(),
            TransferStatus::Running
        );
        // No declared length, bounded by the block size.
        let second = StreamedDataBlock::new(
            info(1, 3000, None, true),
            Box::new(Cursor::new(data[3000..].to_vec())),
        );
        assert_eq!(
            f.handler.write_block_streamed(second).unwrap(),
            TransferStatus::Completed
        );
        assert_eq!(f.provider.file("s.bin").unwrap(), data);

        let token = f
            .handler
            .request_download_token(DownloadRequest::new("s.bin"))
            .unwrap();
        let mut received = Vec::new();
        for n in 0..2 {
            let block = f
                .handler
                .read_block_streamed(&token.transfer.transfer_id, n)
                .unwrap();
            let mut payload = block.data;
            payload.read_to_end(&mut received).unwrap();
        }
        assert_eq!(received, data);
    }

    #[test]
    fn oversized_stream_is_rejected() {
        let f = fixture();
        let id = upload(&f, "s.bin", 5000);
        let block = StreamedDataBlock::new(
            DataBlockInfo {
                transfer_id: id,
                block_number: 0,
                block_length: None,
                offset: 0,
                is_last_block: false,
            },
            Box::new(Cursor::new(pattern(3001))),
        );
        let err = f.handler.write_block_streamed(block).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataBlockInvalid);
    }

    #[test]
    fn cancel_discards_and_releases() {
        let f = fixture();
        let id = upload(&f, "a.bin", 6000);
        f.handler.write_block(block(&id, 0, &pattern(3000), false)).unwrap();
        let record = f.handler.store().get(&id).unwrap();

        assert_eq!(
            f.handler.cancel(&id, AbortReason::ClientAbort),
            TransferStatus::Aborted
        );
        assert_eq!(record.abort_reason(), Some(AbortReason::ClientAbort));
        assert_eq!(f.provider.discarded(), 1);
        assert!(f.provider.file("a.bin").is_none());
        assert_eq!(f.locks.lock_state("a.bin"), ResourceLockState::Unlocked);
        assert_eq!(f.scheduler.pending(), 0);

        assert_eq!(
            f.handler.cancel(&id, AbortReason::ClientAbort),
            TransferStatus::UnknownTransfer
        );
        assert_eq!(
            f.handler.complete(&id, None).unwrap(),
            TransferStatus::UnknownTransfer
        );
        let err = f
            .handler
            .write_block(block(&id, 1, &pattern(3000), false))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTransfer);
    }

    #[test]
    fn expiration_aborts_transfer() {
        let f = fixture();
        let token = f
            .handler
            .request_upload_token(UploadRequest::new("a.bin", 10))
            .unwrap();
        let id = token.transfer.transfer_id.clone();
        let expiration = token.transfer.expiration.unwrap();
        assert_eq!(expiration - token.transfer.created, TimeDelta::seconds(1800));
        assert_eq!(f.scheduler.deadlines(), [expiration]);
        let record = f.handler.store().get(&id).unwrap();

        assert_eq!(f.scheduler.fire_all(), 1);
        assert_eq!(f.handler.get_status(&id), TransferStatus::UnknownTransfer);
        assert_eq!(record.status(), TransferStatus::Aborted);
        assert_eq!(record.abort_reason(), Some(AbortReason::Expired));
        assert_eq!(f.locks.lock_state("a.bin"), ResourceLockState::Unlocked);
        assert_eq!(f.provider.discarded(), 1);
        assert!(!f.handler.expire(&id));
    }

    #[test]
    fn transfer_lock_is_held_until_the_transfer_expires() {
        let f = fixture();
        let id = upload(&f, "a.bin", 10);
        let record = f.handler.store().get(&id).unwrap();
        {
            let state = record.state();
            let guard = state.lock.as_ref().unwrap();
            assert_eq!(guard.lock().expiration, None);
            assert!(guard.secondary_locks().iter().all(|l| l.expiration.is_none()));
        }

        f.handler.pause(&id).unwrap();
        assert!(!f.locks.try_write_lock("a.bin", None).is_enabled());
        assert!(!f.locks.try_read_lock("a.bin", None).is_enabled());
        assert!(record.holds_lock());

        assert_eq!(f.scheduler.fire_all(), 1);
        assert_eq!(record.abort_reason(), Some(AbortReason::Expired));
        let lock = f.locks.try_write_lock("a.bin", None);
        assert!(lock.is_enabled());
        f.locks.release(&lock);
    }

    #[test]
    fn completion_cancels_expiration() {
        let f = fixture();
        let id = upload(&f, "a.bin", 1);
        assert_eq!(f.scheduler.pending(), 1);
        f.handler.write_block(block(&id, 0, b"x", true)).unwrap();
        assert_eq!(f.scheduler.pending(), 0);
        assert!(!f.handler.expire(&id));
    }

    #[test]
    fn disabled_expiration_schedules_nothing() {
        let f = fixture_with(
            MemoryProvider::new(),
            TransferConfig {
                transfer_expiration_secs: None,
                ..config()
            },
        );
        let token = f
            .handler
            .request_upload_token(UploadRequest::new("a.bin", 1))
            .unwrap();
        assert!(token.transfer.expiration.is_none());
        assert_eq!(f.scheduler.pending(), 0);
    }

    #[test]
    fn terminal_transition_happens_exactly_once() {
        for _ in 0..50 {
            let f = fixture();
            let id = upload(&f, "race.bin", 3);
            f.handler.write_block(block(&id, 0, b"abc", false)).unwrap();

            let complete = {
                let handler = f.handler.clone();
                let id = id.clone();
                thread::spawn(move || {
                    handler.complete(&id, None).unwrap() == TransferStatus::Completed
                })
            };
            let cancel = {
                let handler = f.handler.clone();
                let id = id.clone();
                thread::spawn(move || {
                    handler.cancel(&id, AbortReason::ClientAbort) == TransferStatus::Aborted
                })
            };
            let expire = {
                let handler = f.handler.clone();
                let id = id.clone();
                thread::spawn(move || handler.expire(&id))
            };

            let winners = [complete, cancel, expire]
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
            assert_eq!(f.locks.lock_state("race.bin"), ResourceLockState::Unlocked);
            assert_eq!(f.handler.get_status(&id), TransferStatus::UnknownTransfer);
        }
    }

    #[test]
    fn reload_token_of_active_and_finished_transfers() {
        let f = fixture();
        let token = f
            .handler
            .request_upload_token(UploadRequest::new("a.bin", 1).content_type("text/x-custom"))
            .unwrap();
        let id = token.transfer.transfer_id.clone();
        assert_eq!(token.transfer.content_type, "text/x-custom");
        assert_eq!(
            f.handler.reload_token(&id).unwrap(),
            IssuedToken::Upload(token)
        );

        f.handler.cancel(&id, AbortReason::ClientAbort);
        let err = f.handler.reload_token(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTransfer);
        let incidents = f.auditor.incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].context, "reload_token");
    }

    #[test]
    fn failures_are_audited_once() {
        let f = fixture();
        let err = f
            .handler
            .write_block(block("missing", 0, b"x", false))
            .unwrap_err();
        assert!(err.is_audited());
        let err = f.handler.get_progress("missing").unwrap_err();
        assert!(err.is_audited());
        let contexts: Vec<_> = f
            .auditor
            .incidents()
            .into_iter()
            .map(|i| i.context)
            .collect();
        assert_eq!(contexts, ["write_block", "get_progress"]);
    }

    #[test]
    fn upload_writer_streams_through_handler() {
        let f = fixture();
        let data = pattern(10_000);
        let token = f
            .handler
            .request_upload_token(UploadRequest::new("w.bin", 10_000))
            .unwrap();

        let mut writer = f.handler.upload_writer(&token);
        writer.write_all(&data).unwrap();
        writer.finish().unwrap();

        assert_eq!(f.provider.file("w.bin").unwrap(), data);
        assert_eq!(
            f.handler.get_status(&token.transfer.transfer_id),
            TransferStatus::UnknownTransfer
        );
        assert_eq!(f.locks.lock_state("w.bin"), ResourceLockState::Unlocked);
    }

    #[test]
    fn upload_writer_resumes_after_received_blocks() {
        let f = fixture();
        let data = pattern(7000);
        let token = f
            .handler
            .request_upload_token(UploadRequest::new("w.bin", 7000))
            .unwrap();
        let id = token.transfer.transfer_id.clone();
        f.handler.write_block(block(&id, 0, &data[..3000], false)).unwrap();
        f.handler.pause(&id).unwrap();
        f.handler.resume(&id).unwrap();

        let mut writer = f.handler.upload_writer(&token);
        assert_eq!(writer.block_number(), 1);
        assert_eq!(writer.offset(), 3000);
        writer.write_all(&data[3000..]).unwrap();
        writer.finish().unwrap();
        assert_eq!(f.provider.file("w.bin").unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_expires_transfers() {
        let provider = MemoryProvider::new();
        let locks = Arc::new(LockRepository::new());
        let handler = TransferHandler::builder(
            provider.clone(),
            Arc::new(TokioScheduler::new(Handle::current())),
        )
        .locks(Arc::clone(&locks))
        .config(TransferConfig {
            transfer_expiration_secs: Some(5),
            ..config()
        })
        .build();

        let token = handler
            .request_upload_token(UploadRequest::new("a.bin", 1))
            .unwrap();
        let id = token.transfer.transfer_id;
        assert_eq!(handler.get_status(&id), TransferStatus::Starting);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handler.get_status(&id), TransferStatus::UnknownTransfer);
        assert_eq!(locks.lock_state("a.bin"), ResourceLockState::Unlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_sweeper_prunes_idle_trackers() {
        let f = fixture();
        let lock = f.locks.try_read_lock("idle.bin", None);
        f.locks.release(&lock);
        assert_eq!(f.locks.tracker_count(), 1);

        let stop = f.handler.spawn_lock_sweeper(&Handle::current());
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(f.locks.tracker_count(), 0);
        stop.cancel();
    }
}
