//! Storage backend seams consumed by the transfer handler.

use std::io::{Read, Seek};
use std::path::Path;

use tessera_protocol::{ResourceInfo, TransferCapabilities, UploadToken};

use crate::VfsError;

/// Readable, seekable resource content.
pub trait ResourceReader: Read + Seek + Send {}

impl<T: Read + Seek + Send> ResourceReader for T {}

/// A storage backend (local disk, archive, blob container, ...).
pub trait StorageProvider: Send + Sync {
    /// Returns the canonical form of `resource_id`, or fails with
    /// `InvalidResourcePath`. Lock keys and transfer records use the
    /// canonical id.
    fn resolve_id(&self, resource_id: &str) -> Result<String, VfsError> {
        Ok(resource_id.to_string())
    }

    /// Metadata of an existing resource, `None` if it does not exist.
    fn resource_info(&self, resource_id: &str) -> Result<Option<ResourceInfo>, VfsError>;

    /// Folder ids containing `resource_id`, nearest first.
    fn ancestors(&self, resource_id: &str) -> Result<Vec<String>, VfsError>;

    fn open_read(&self, resource_id: &str) -> Result<Box<dyn ResourceReader>, VfsError>;

    /// Prepares the area an upload writes into until it is committed.
    fn create_staging(&self, token: &UploadToken) -> Result<Box<dyn UploadStaging>, VfsError>;

    fn capabilities(&self) -> TransferCapabilities;
}

/// Temporary destination of an upload.
///
/// Data only becomes visible as the target resource on [`commit`](Self::commit).
pub trait UploadStaging: Send {
    /// Writes `data` at `offset`, accepting at most `limit` bytes.
    /// Returns the number of bytes written.
    fn write_at(&mut self, offset: u64, limit: u64, data: &mut dyn Read)
    -> Result<u64, VfsError>;

    /// Releases open handles. The next write or read reopens them.
    fn suspend(&mut self) -> Result<(), VfsError>;

    /// Opens the staged content for reading, e.g. for hashing.
    fn open_staged(&mut self) -> Result<Box<dyn ResourceReader>, VfsError>;

    /// Publishes the staged data as the target resource.
    fn commit(self: Box<Self>) -> Result<ResourceInfo, VfsError>;

    /// Deletes the staged data.
    fn discard(self: Box<Self>) -> Result<(), VfsError>;
}

/// Detects a MIME content type from a file name extension.
pub fn detect_content_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
