//! Configuration for ferry.
//!
//! Resolution order: command-line flags → config file → defaults.
//!
//! Config file location:
//!   1. `--config <path>`
//!   2. `$FERRY_CONFIG`
//!
//! Without either, built-in defaults are used.

use crate::streaming::protocol::DEFAULT_BLOCK_SIZE;
use crate::streaming::{ReceiverConfig, SenderConfig};
use crate::transport::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest block size accepted; the smallest sector size direct I/O supports.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest block size accepted.
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FerryConfig {
    pub transfer: TransferConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

/// Settings both sides must agree on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per chunk. Power of two; sender and receiver must match.
    pub block_size: usize,
    /// Per-operation deadline in seconds. 0 = none.
    pub io_timeout_secs: u64,
    /// Bypass the page cache (Linux only, ignored elsewhere).
    pub direct_io: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Address of the receiving server.
    pub server: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub listen: String,
    pub port: u16,
    /// Directory received files are stored in.
    pub dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            io_timeout_secs: 0,
            direct_io: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            dir: PathBuf::from("."),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid block size {0}: need a power of two in {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}")]
    InvalidBlockSize(usize),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load `path`, or defaults when no file was given.
    ///
    /// Not validated: command-line overrides still apply on top, so callers
    /// run [`FerryConfig::validate`] once those are in.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate()
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            block_size: self.transfer.block_size,
            io_timeout: self.transfer.io_timeout(),
            direct_io: self.transfer.direct_io,
        }
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            root: self.server.dir.clone(),
            block_size: self.transfer.block_size,
            io_timeout: self.transfer.io_timeout(),
            direct_io: self.transfer.direct_io,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.block_size;
        if !size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
            return Err(ConfigError::InvalidBlockSize(size));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_secs > 0).then(|| Duration::from_secs(self.io_timeout_secs))
    }
}
