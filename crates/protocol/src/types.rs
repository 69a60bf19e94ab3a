use serde::{Deserialize, Serialize};

/// Metadata of a storage resource as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub resource_id: String,
    pub name: String,
    pub length: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default)]
    pub is_folder: bool,
}

/// Lifecycle state of a transfer.
///
/// `UnknownTransfer` is only ever returned by queries for transfer ids that
/// are not (or no longer) registered; it is never stored on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "aborted")]
    Aborted,
    #[serde(rename = "unknown_transfer")]
    UnknownTransfer,
}

impl TransferStatus {
    /// Returns `true` while the transfer still holds its lock.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }

    /// Returns `true` if blocks may be read or written in this state.
    pub fn accepts_blocks(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Why a transfer was terminated before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    #[serde(rename = "client_abort")]
    ClientAbort,
    #[serde(rename = "expired")]
    Expired,
    #[serde(rename = "verification_failure")]
    VerificationFailure,
    #[serde(rename = "server_error")]
    ServerError,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ClientAbort => "client abort",
            Self::Expired => "expired",
            Self::VerificationFailure => "verification failure",
            Self::ServerError => "server error",
        };
        f.write_str(s)
    }
}

/// Block transmission features of a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransmissionCapabilities {
    /// Blocks must arrive in ascending order without gaps.
    pub sequential_blocks_required: bool,
    /// Blocks may be read in any order.
    pub random_block_reads: bool,
    /// Block payloads may be handed over as streams.
    pub streamed_blocks: bool,
}

impl Default for TransmissionCapabilities {
    fn default() -> Self {
        Self {
            sequential_blocks_required: true,
            random_block_reads: true,
            streamed_blocks: true,
        }
    }
}

/// Capabilities a transfer handler advertises to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCapabilities {
    pub max_block_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_resource_size: Option<u64>,
    pub transmission: TransmissionCapabilities,
}

/// Point-in-time progress of an active transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub block_count: u64,
}

impl TransferProgress {
    /// Returns the transfer progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}
