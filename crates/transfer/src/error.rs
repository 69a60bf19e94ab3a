use std::fmt;
use std::io;

/// Classification of a [`VfsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ResourceNotFound,
    /// Permission or scope violation.
    ResourceAccessDenied,
    /// Unexpected storage failure; the original cause is attached as source.
    ResourceAccess,
    ResourceOverwriteConflict,
    ResourceLocked,
    InvalidResourcePath,
    UnknownTransfer,
    /// The transfer is in the wrong state for the requested operation.
    TransferStatusInvalid,
    /// Bad block number, size or sequence.
    DataBlockInvalid,
    IntegrityCheckFailed,
}

impl ErrorKind {
    /// Stable snake_case identifier, used as audit event id.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResourceNotFound => "resource_not_found",
            Self::ResourceAccessDenied => "resource_access_denied",
            Self::ResourceAccess => "resource_access",
            Self::ResourceOverwriteConflict => "resource_overwrite_conflict",
            Self::ResourceLocked => "resource_locked",
            Self::InvalidResourcePath => "invalid_resource_path",
            Self::UnknownTransfer => "unknown_transfer",
            Self::TransferStatusInvalid => "transfer_status_invalid",
            Self::DataBlockInvalid => "data_block_invalid",
            Self::IntegrityCheckFailed => "integrity_check_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error produced by the transfer engine and storage providers.
///
/// The `audited` marker is set once the error has been reported to the
/// auditor, so that it is not reported again while it bubbles up.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct VfsError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
    audited: bool,
}

impl VfsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            audited: false,
        }
    }

    /// Attaches the underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_audited(&self) -> bool {
        self.audited
    }

    pub(crate) fn mark_audited(&mut self) {
        self.audited = true;
    }

    pub fn not_found(resource_id: &str) -> Self {
        Self::new(
            ErrorKind::ResourceNotFound,
            format!("resource not found: {resource_id}"),
        )
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceAccessDenied, message)
    }

    /// Wraps an unexpected storage failure.
    pub fn access(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::ResourceAccess, message).with_source(source)
    }

    pub fn overwrite_conflict(resource_id: &str) -> Self {
        Self::new(
            ErrorKind::ResourceOverwriteConflict,
            format!("resource already exists: {resource_id}"),
        )
    }

    pub fn locked(resource_id: &str) -> Self {
        Self::new(
            ErrorKind::ResourceLocked,
            format!("resource is locked: {resource_id}"),
        )
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResourcePath, message)
    }

    pub fn unknown_transfer(transfer_id: &str) -> Self {
        Self::new(
            ErrorKind::UnknownTransfer,
            format!("unknown transfer: {transfer_id}"),
        )
    }

    pub fn status_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransferStatusInvalid, message)
    }

    pub fn block_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataBlockInvalid, message)
    }

    pub fn integrity(transfer_id: &str) -> Self {
        Self::new(
            ErrorKind::IntegrityCheckFailed,
            format!("content hash mismatch for transfer {transfer_id}"),
        )
    }
}

impl From<io::Error> for VfsError {
    /// Unwraps a `VfsError` that travelled through an `io::Error`, otherwise
    /// wraps the failure as [`ErrorKind::ResourceAccess`].
    fn from(err: io::Error) -> Self {
        match err.downcast::<VfsError>() {
            Ok(inner) => inner,
            Err(err) => {
                let message = format!("I/O failure: {err}");
                Self::access(message, err)
            }
        }
    }
}

impl From<VfsError> for io::Error {
    fn from(err: VfsError) -> Self {
        io::Error::other(err)
    }
}
