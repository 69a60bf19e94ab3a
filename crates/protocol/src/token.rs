//! Transfer tokens handed to clients when a transfer is opened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fields common to upload and download tokens.
///
/// A token is immutable once issued. Changing any of its properties means
/// issuing a new token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferToken {
    pub transfer_id: String,
    pub resource_id: String,
    pub resource_name: String,
    pub resource_length: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

impl TransferToken {
    /// Returns `true` if the token has an expiration at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }
}

/// Token for writing a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadToken {
    #[serde(flatten)]
    pub transfer: TransferToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_resource_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_block_size: Option<u64>,
}

/// Token for reading a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadToken {
    #[serde(flatten)]
    pub transfer: TransferToken,
    /// SHA-256 hex digest of the resource, if requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_block_count: Option<u64>,
}

/// Either kind of token, as returned by a token reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum IssuedToken {
    Upload(UploadToken),
    Download(DownloadToken),
}

impl IssuedToken {
    /// Returns the shared token fields.
    pub fn transfer(&self) -> &TransferToken {
        match self {
            Self::Upload(t) => &t.transfer,
            Self::Download(t) => &t.transfer,
        }
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer().transfer_id
    }
}
