//! Configuration for FalconKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{KvError, Result};

/// Default name of the running-config file inside the workspace
pub const RUNNING_CONFIG_FILENAME: &str = "running_config.json";

/// Period of the background checkpoint/compaction worker unless overridden
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Longest key accepted by `put`, matching the FalconFS KV IPC limit
pub const DEFAULT_MAX_KEY_SIZE: usize = 2048;

/// Main configuration for a FalconKV engine
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Workspace Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all persisted state
    /// Internal structure:
    ///   {workspace}/
    ///     ├── LOCK                  (exclusive engine lock)
    ///     ├── running_config.json   (default running-config location)
    ///     └── segments/             (append-only log segments)
    pub workspace: PathBuf,

    /// Running-config file. `None` places it inside the workspace.
    pub running_config_path: Option<PathBuf>,

    /// What to do when the running-config file exists but fails validation
    pub on_config_corrupt: ConfigCorruptPolicy,

    // -------------------------------------------------------------------------
    // Log Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync the active segment
    pub sync_strategy: SyncStrategy,

    /// Size (bytes) at which the active segment is sealed and a new one opened
    pub segment_size_limit: u64,

    // -------------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------------
    /// Max key length in bytes
    pub max_key_size: usize,

    /// Max value length in bytes
    pub max_value_size: usize,

    // -------------------------------------------------------------------------
    // Maintenance Configuration
    // -------------------------------------------------------------------------
    /// Period of the background checkpoint/compaction worker (`None` disables it)
    pub maintenance_interval: Option<Duration>,

    /// Fraction of dead bytes in eligible segments that triggers background compaction
    pub compaction_garbage_ratio: f64,
}

/// Log sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every append (safest; a returned Put/Delete is on disk)
    EveryWrite,

    /// fsync after N appends (acknowledged writes may be lost on power failure)
    EveryNEntries { count: usize },
}

/// Reaction to a running-config file that exists but cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCorruptPolicy {
    /// Ignore the checkpoint and fully replay the log; the error is kept in the
    /// recovery report
    Replay,

    /// Fail `Engine::open` with `KvError::ConfigCorrupt`
    Fail,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("./falconkv_data"),
            running_config_path: None,
            on_config_corrupt: ConfigCorruptPolicy::Replay,
            sync_strategy: SyncStrategy::EveryWrite,
            segment_size_limit: 64 * 1024 * 1024, // 64 MB
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: 16 * 1024 * 1024, // 16 MB
            maintenance_interval: Some(DEFAULT_MAINTENANCE_INTERVAL),
            compaction_garbage_ratio: 0.5,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Resolved location of the running-config file
    pub fn running_config_path(&self) -> PathBuf {
        self.running_config_path
            .clone()
            .unwrap_or_else(|| self.workspace.join(RUNNING_CONFIG_FILENAME))
    }

    /// Reject settings the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.workspace.as_os_str().is_empty() {
            return Err(KvError::Config("workspace path is empty".into()));
        }
        if self.max_key_size == 0 {
            return Err(KvError::Config("max_key_size must be positive".into()));
        }
        if let SyncStrategy::EveryNEntries { count: 0 } = self.sync_strategy {
            return Err(KvError::Config("sync count must be positive".into()));
        }
        if self.maintenance_interval == Some(Duration::ZERO) {
            return Err(KvError::Config("maintenance_interval must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.compaction_garbage_ratio) {
            return Err(KvError::Config(format!(
                "compaction_garbage_ratio {} outside [0, 1]",
                self.compaction_garbage_ratio
            )));
        }
        // A maximal entry must fit in one segment and in the u32 length field
        let max_entry = crate::log::max_encoded_len(self.max_key_size, self.max_value_size);
        if max_entry > u32::MAX as u64 {
            return Err(KvError::Config(format!(
                "max entry size {} exceeds the log format limit",
                max_entry
            )));
        }
        if self.segment_size_limit < crate::log::SEGMENT_HEADER_SIZE + max_entry {
            return Err(KvError::Config(format!(
                "segment_size_limit {} cannot hold an entry of {} bytes",
                self.segment_size_limit, max_entry
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the workspace directory (root for all storage)
    pub fn workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspace = path.into();
        self
    }

    /// Set an explicit running-config file location
    pub fn running_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.running_config_path = Some(path.into());
        self
    }

    /// Set the corrupt running-config policy
    pub fn on_config_corrupt(mut self, policy: ConfigCorruptPolicy) -> Self {
        self.config.on_config_corrupt = policy;
        self
    }

    /// Set the log sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the segment rotation threshold (in bytes)
    pub fn segment_size_limit(mut self, size: u64) -> Self {
        self.config.segment_size_limit = size;
        self
    }

    /// Set the maximum key length (in bytes)
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self
    }

    /// Set the maximum value length (in bytes)
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.config.max_value_size = size;
        self
    }

    /// Set the background maintenance period; `None` disables the worker
    pub fn maintenance_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.maintenance_interval = interval;
        self
    }

    /// Set the garbage ratio that triggers background compaction
    pub fn compaction_garbage_ratio(mut self, ratio: f64) -> Self {
        self.config.compaction_garbage_ratio = ratio;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
