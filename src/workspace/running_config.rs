//! Running config file
//!
//! A small JSON document recording where the log was last known to be
//! durable and whether the previous engine shut down cleanly.
//!
//! ## File Format
//! ```text
//! {
//!   "format_version": 1,
//!   "checksum": <crc32 of the serialized "config" object>,
//!   "config": { "workspace": ..., "clean_shutdown": ..., "checkpoint": {...}, "updated_at_ms": ... }
//! }
//! ```
//!
//! Replaced atomically: write temp file, fsync, rename, fsync directory.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KvError, Result};
use crate::log::LogPosition;

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// A log position known to be durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub segment_id: u64,
    pub offset: u64,
    /// Highest sequence number at or before the checkpoint
    pub sequence: u64,
}

impl From<LogPosition> for Checkpoint {
    fn from(pos: LogPosition) -> Self {
        Self {
            segment_id: pos.segment_id,
            offset: pos.offset,
            sequence: pos.sequence,
        }
    }
}

/// Persisted engine metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningConfig {
    /// Workspace this file was written for
    pub workspace: PathBuf,

    /// `false` from Init until a clean shutdown completes
    pub clean_shutdown: bool,

    pub checkpoint: Checkpoint,

    /// Unix millis of the last write
    pub updated_at_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    checksum: u32,
    config: RunningConfig,
}

impl RunningConfig {
    pub fn new(workspace: &Path, clean_shutdown: bool, checkpoint: Checkpoint) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            clean_shutdown,
            checkpoint,
            updated_at_ms: now_millis(),
        }
    }

    /// Read and validate the file at `path`
    ///
    /// `Ok(None)` if it does not exist; `ConfigCorrupt` if it exists but does
    /// not parse, carries an unknown version or fails its checksum.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KvError::Io(e)),
        };

        let envelope: Envelope = serde_json::from_slice(&data).map_err(|e| {
            KvError::ConfigCorrupt(format!("{}: {}", path.display(), e))
        })?;
        if envelope.format_version != FORMAT_VERSION {
            return Err(KvError::ConfigCorrupt(format!(
                "{}: unsupported format version {}",
                path.display(),
                envelope.format_version
            )));
        }
        let computed = checksum(&envelope.config)?;
        if computed != envelope.checksum {
            return Err(KvError::ConfigCorrupt(format!(
                "{}: checksum mismatch (stored {:#010x}, computed {:#010x})",
                path.display(),
                envelope.checksum,
                computed
            )));
        }
        Ok(Some(envelope.config))
    }

    /// Atomically replace the file at `path` with this config
    pub fn store(&self, path: &Path) -> Result<()> {
        let envelope = Envelope {
            format_version: FORMAT_VERSION,
            checksum: checksum(self)?,
            config: self.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| KvError::Serialization(e.to_string()))?;

        let tmp = temp_path(path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            let dir = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            File::open(dir)?.sync_all()?;
        }

        debug!(
            path = %path.display(),
            clean_shutdown = self.clean_shutdown,
            checkpoint_sequence = self.checkpoint.sequence,
            "Running config written"
        );
        Ok(())
    }
}

fn checksum(config: &RunningConfig) -> Result<u32> {
    let bytes = serde_json::to_vec(config).map_err(|e| KvError::Serialization(e.to_string()))?;
    Ok(crc32fast::hash(&bytes))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
