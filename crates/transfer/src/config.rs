//! Transfer engine configuration.
//!
//! Stored as camelCase JSON. Every field is optional in the file; missing
//! fields take their defaults and out-of-range values are clamped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default maximum block size: 4 MiB.
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Default block size of download tokens: 1 MiB.
pub const DEFAULT_DOWNLOAD_BLOCK_SIZE: u64 = 1024 * 1024;

/// Upper bound accepted for any block size.
pub const BLOCK_SIZE_LIMIT: u64 = 64 * 1024 * 1024;

/// Default transfer expiration: 30 minutes.
pub const DEFAULT_EXPIRATION_SECS: u64 = 1800;

const DEFAULT_LOCK_SWEEP_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    max_block_size: Option<u64>,
    download_block_size: Option<u64>,
    auto_flush_threshold: Option<u64>,
    max_upload_size: Option<u64>,
    #[serde(default = "default_expiration")]
    transfer_expiration_secs: Option<u64>,
    lock_sweep_interval_secs: Option<u64>,
}

fn default_expiration() -> Option<u64> {
    Some(DEFAULT_EXPIRATION_SECS)
}

/// Transfer engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// Largest block accepted or served.
    pub max_block_size: u64,
    /// Block size of download tokens when the client does not ask for one.
    pub download_block_size: u64,
    /// Auto-flush threshold of client-side upload writers; `None` flushes
    /// only full blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_flush_threshold: Option<u64>,
    /// Largest resource accepted for upload; `None` for no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_upload_size: Option<u64>,
    /// Lifetime of tokens and their locks; `None` never expires.
    pub transfer_expiration_secs: Option<u64>,
    pub lock_sweep_interval_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            download_block_size: DEFAULT_DOWNLOAD_BLOCK_SIZE,
            auto_flush_threshold: None,
            max_upload_size: None,
            transfer_expiration_secs: Some(DEFAULT_EXPIRATION_SECS),
            lock_sweep_interval_secs: DEFAULT_LOCK_SWEEP_SECS,
        }
    }
}

impl TransferConfig {
    /// Loads configuration from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses configuration JSON, applying defaults and clamping.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let file: ConfigFile = serde_json::from_str(json)?;
        let defaults = Self::default();
        let config = Self {
            max_block_size: file.max_block_size.unwrap_or(defaults.max_block_size),
            download_block_size: file
                .download_block_size
                .unwrap_or(defaults.download_block_size),
            auto_flush_threshold: file.auto_flush_threshold,
            max_upload_size: file.max_upload_size,
            transfer_expiration_secs: file.transfer_expiration_secs,
            lock_sweep_interval_secs: file
                .lock_sweep_interval_secs
                .unwrap_or(defaults.lock_sweep_interval_secs),
        };
        Ok(config.clamped())
    }

    /// Brings every value into its valid range, logging each correction.
    pub fn clamped(mut self) -> Self {
        if self.max_block_size == 0 || self.max_block_size > BLOCK_SIZE_LIMIT {
            let clamped = self.max_block_size.clamp(1, BLOCK_SIZE_LIMIT);
            warn!(
                value = self.max_block_size,
                clamped, "maxBlockSize out of range, clamping"
            );
            self.max_block_size = clamped;
        }
        if self.download_block_size == 0 || self.download_block_size > self.max_block_size {
            let clamped = self.download_block_size.clamp(1, self.max_block_size);
            warn!(
                value = self.download_block_size,
                clamped, "downloadBlockSize out of range, clamping"
            );
            self.download_block_size = clamped;
        }
        if let Some(threshold) = self.auto_flush_threshold {
            if threshold > self.max_block_size {
                warn!(
                    value = threshold,
                    clamped = self.max_block_size,
                    "autoFlushThreshold above maxBlockSize, clamping"
                );
                self.auto_flush_threshold = Some(self.max_block_size);
            }
        }
        if self.transfer_expiration_secs == Some(0) {
            warn!("transferExpirationSecs of 0 would expire transfers at once, using default");
            self.transfer_expiration_secs = Some(DEFAULT_EXPIRATION_SECS);
        }
        if self.lock_sweep_interval_secs == 0 {
            warn!("lockSweepIntervalSecs must be positive, using default");
            self.lock_sweep_interval_secs = DEFAULT_LOCK_SWEEP_SECS;
        }
        self
    }

    pub fn transfer_expiration(&self) -> Option<Duration> {
        self.transfer_expiration_secs.map(Duration::from_secs)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs)
    }

    /// Auto-flush threshold for a writer using `block_size`.
    pub fn flush_threshold(&self, block_size: u64) -> u64 {
        self.auto_flush_threshold
            .map_or(block_size, |t| t.min(block_size))
    }
}
