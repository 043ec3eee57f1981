//! Workspace & Config Manager
//!
//! A workspace is the directory that owns all persisted state of one engine.
//!
//! ```text
//! {workspace}/
//!   ├── LOCK                  (held exclusively while an engine is live)
//!   ├── running_config.json   (default location; configurable)
//!   └── segments/
//!         ├── segment_0000000001.log
//!         └── ...
//! ```

mod lock;
mod running_config;

pub use lock::WorkspaceLock;
pub use running_config::{Checkpoint, RunningConfig, FORMAT_VERSION};

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Name of the lock file inside the workspace
pub const LOCK_FILENAME: &str = "LOCK";

/// Directory holding the log segments
pub const SEGMENTS_DIR: &str = "segments";

/// An open, exclusively locked workspace
pub struct Workspace {
    root: PathBuf,
    running_config_path: PathBuf,
    lock: WorkspaceLock,
}

impl Workspace {
    /// Create the workspace if it is missing and lock it
    ///
    /// Fails with `WorkspaceLocked` immediately if another handle, in this
    /// process or another one, holds the lock.
    pub fn open(root: &Path, running_config_path: PathBuf) -> Result<Self> {
        let lock = WorkspaceLock::acquire(root)?;
        fs::create_dir_all(root.join(SEGMENTS_DIR))?;
        if let Some(parent) = running_config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        debug!(
            workspace = %root.display(),
            running_config = %running_config_path.display(),
            "Workspace opened"
        );
        Ok(Self {
            root: root.to_path_buf(),
            running_config_path,
            lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.root.join(SEGMENTS_DIR)
    }

    pub fn running_config_path(&self) -> &Path {
        &self.running_config_path
    }

    pub fn lock(&self) -> &WorkspaceLock {
        &self.lock
    }

    /// Load the running config; `Ok(None)` when the file does not exist
    pub fn load_running_config(&self) -> Result<Option<RunningConfig>> {
        RunningConfig::load(&self.running_config_path)
    }

    /// Atomically replace the running config
    pub fn store_running_config(&self, config: &RunningConfig) -> Result<()> {
        config.store(&self.running_config_path)
    }
}
