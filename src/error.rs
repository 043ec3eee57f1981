//! Error types for FalconKV
//!
//! Provides a unified error type for all operations. A missing key is not an
//! error: reads return `Option` and deletes return `bool`.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using KvError
pub type Result<T> = std::result::Result<T, KvError>;

/// Unified error type for FalconKV operations
#[derive(Debug, Error)]
pub enum KvError {
    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A previous append failed and its partial bytes could not be rolled back.
    #[error("Log writer poisoned: {0}")]
    WriterPoisoned(String),

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Running config corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Workspace Errors
    // -------------------------------------------------------------------------
    #[error("Workspace is locked by another engine: {}", .0.display())]
    WorkspaceLocked(PathBuf),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KvError {
    /// Whether retrying the same call could succeed.
    ///
    /// The engine itself never retries; this only classifies the failure for
    /// callers that want to.
    pub fn is_retriable(&self) -> bool {
        matches!(self, KvError::Io(_))
    }
}

impl From<bincode::Error> for KvError {
    fn from(e: bincode::Error) -> Self {
        KvError::Serialization(e.to_string())
    }
}
