// Engine Configuration
//
// Tunables for partition logs and the topic registry.
// Loadable from JSON; every field has a default.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Default segment size bound (1 MiB).
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 1024 * 1024;

/// Default read budget for broker fetches.
pub const DEFAULT_MAX_BYTES: u32 = 4096;

/// Per-partition log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Rotate once the active segment's log file reaches this many bytes.
    pub segment_max_bytes: u64,

    /// `sync_data` both segment files after every append.
    pub sync_on_append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            sync_on_append: true,
        }
    }
}

impl LogConfig {
    pub fn with_segment_max_bytes(mut self, bytes: u64) -> Self {
        self.segment_max_bytes = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_max_bytes == 0 {
            return Err(StorageError::InvalidConfig(
                "segment_max_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Topic registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Root directory; each topic gets a subdirectory.
    pub data_dir: PathBuf,

    /// Settings applied to every topic's log.
    pub log: LogConfig,

    /// Read budget used when a fetch does not name one.
    pub default_max_bytes: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./broker_data"),
            log: LogConfig::default(),
            default_max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl BrokerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.log.validate()
    }
}
