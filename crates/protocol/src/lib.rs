//! Shared data types for the Tessera transfer core.
//!
//! Everything a protocol collaborator (REST, RPC, in-process clients) needs
//! to describe a transfer lives here: tokens, data block descriptors,
//! transfer statuses and capability flags. The types derive `serde` so a
//! hosting layer can pick its own encoding; no wire format is implied.

pub mod block;
pub mod token;
pub mod types;

// Re-export primary types for convenience.
pub use block::{BufferedDataBlock, DataBlockInfo, StreamedDataBlock};
pub use token::{DownloadToken, IssuedToken, TransferToken, UploadToken};
pub use types::{
    AbortReason, ResourceInfo, TransferCapabilities, TransferProgress, TransferStatus,
    TransmissionCapabilities,
};
