//! Workspace locking
//!
//! Prevents two engines from opening the same workspace. The lock is an
//! OS-level advisory lock (`flock` on Unix) on `{workspace}/LOCK`, so it is
//! released even if the process crashes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{error, info};

use crate::error::{KvError, Result};

use super::LOCK_FILENAME;

/// An exclusive lock on a workspace, released on drop
pub struct WorkspaceLock {
    /// Kept open to hold the lock
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Acquire the lock without blocking, creating the workspace if needed
    pub fn acquire(workspace: &Path) -> Result<Self> {
        fs::create_dir_all(workspace)?;
        let path = workspace.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                info!(path = %path.display(), "Acquired workspace lock");
                Ok(Self { file, path })
            }
            Err(e) if is_contended(&e) => {
                error!(workspace = %workspace.display(), "Workspace is locked by another engine");
                Err(KvError::WorkspaceLocked(workspace.to_path_buf()))
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to lock workspace");
                Err(KvError::Io(e))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// EWOULDBLOCK surfaces as 11 on Linux and 35 on macOS when the kind is not mapped
fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || matches!(e.raw_os_error(), Some(11) | Some(35))
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        match FileExt::unlock(&self.file) {
            Ok(()) => info!(path = %self.path.display(), "Released workspace lock"),
            Err(e) => error!(path = %self.path.display(), error = %e, "Failed to release workspace lock"),
        }
    }
}
