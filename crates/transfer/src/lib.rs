//! Block transfer engine.
//!
//! Resources are moved in numbered data blocks under a transfer token. The
//! [`TransferHandler`] issues tokens, locks the resource for the lifetime of
//! the transfer, applies and serves blocks through a [`StorageProvider`],
//! and finishes each transfer exactly once (complete, cancel or expire).
//!
//! Client-side helpers turn byte streams into blocks and back
//! ([`BufferedBlockWriter`], [`BufferedBlockReader`] and their streamed
//! variants). [`ChunkStream`] exposes a byte window of a seekable source.

mod audit;
mod checksum;
mod claims;
mod codec;
mod config;
mod error;
mod handler;
mod local;
mod provider;
mod record;
mod scheduler;
mod store;
mod validation;
mod window;

#[cfg(test)]
mod testing;

pub use audit::{AuditIncident, AuditLevel, Auditor, TracingAuditor};
pub use checksum::{
    ContentHasher, Sha256Hasher, calculate_file_checksum, checksum_bytes, checksum_reader,
};
pub use claims::{AllowAllClaims, ClaimsProvider, ResourceClaims};
pub use codec::{BufferedBlockReader, BufferedBlockWriter, StreamedBlockReader, StreamedBlockWriter};
pub use config::{
    BLOCK_SIZE_LIMIT, ConfigError, DEFAULT_DOWNLOAD_BLOCK_SIZE, DEFAULT_EXPIRATION_SECS,
    DEFAULT_MAX_BLOCK_SIZE, TransferConfig,
};
pub use error::{ErrorKind, VfsError};
pub use handler::{DownloadRequest, TransferHandler, TransferHandlerBuilder, UploadRequest};
pub use local::LocalFileProvider;
pub use provider::{ResourceReader, StorageProvider, UploadStaging, detect_content_type};
pub use record::TransferRecord;
pub use scheduler::{Job, JobHandle, Scheduler, TokioScheduler};
pub use store::{InMemoryTransferStore, TransferStore};
pub use validation::{ancestor_ids, normalize_resource_id, resource_name};
pub use window::{ChunkStream, write_window};
