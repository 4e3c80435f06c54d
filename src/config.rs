//! Database configuration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AppId, ShardId};

/// Default shard size past which an early compaction is scheduled.
pub const DEFAULT_COMPACTION_SIZE_THRESHOLD: u64 = 0x10000;

/// Upper clamp for the compaction size threshold (just under the 100 MiB
/// file cap, so a shard always compacts before it becomes unreadable).
pub const MAX_COMPACTION_SIZE_THRESHOLD: u64 = 0x630_0000;

const DEFAULT_COMPACTION_INTERVAL_MINUTES: u64 = 30;
const DEFAULT_CHECK_INTERVAL_MINUTES: u64 = 15;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Identifies the database; all cooperating processes share this.
    pub app_id: AppId,
    /// Identifies this process's shard; must be unique per process.
    pub shard_id: ShardId,
    /// Directory holding snapshot, shard and lock files.
    #[serde(default)]
    pub base_directory: PathBuf,
    /// Shard size in bytes past which compaction is eagerly scheduled.
    #[serde(default = "default_size_threshold")]
    pub compaction_size_threshold: u64,
    /// Periodic compaction cadence in minutes; 0 disables the timer.
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval_minutes: u64,
    /// Periodic rebase-check cadence in minutes; 0 disables the timer.
    #[serde(default = "default_check_interval")]
    pub check_interval_minutes: u64,
}

fn default_size_threshold() -> u64 {
    DEFAULT_COMPACTION_SIZE_THRESHOLD
}

fn default_compaction_interval() -> u64 {
    DEFAULT_COMPACTION_INTERVAL_MINUTES
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_MINUTES
}

impl Config {
    pub fn new(app_id: AppId, shard_id: ShardId) -> Self {
        Self {
            app_id,
            shard_id,
            base_directory: PathBuf::new(),
            compaction_size_threshold: DEFAULT_COMPACTION_SIZE_THRESHOLD,
            compaction_interval_minutes: DEFAULT_COMPACTION_INTERVAL_MINUTES,
            check_interval_minutes: DEFAULT_CHECK_INTERVAL_MINUTES,
        }
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config)
    }

    /// The effective size threshold, clamped to the supported maximum.
    pub fn effective_size_threshold(&self) -> u64 {
        self.compaction_size_threshold
            .min(MAX_COMPACTION_SIZE_THRESHOLD)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
