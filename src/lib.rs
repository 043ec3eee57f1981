//! # FalconKV
//!
//! A workspace-scoped, crash-consistent key-value engine with:
//! - A segmented, checksummed append-only log as the single source of truth
//! - Crash recovery with torn-write truncation
//! - An in-memory index rebuilt from the log at startup
//! - Single-writer/multi-reader concurrency model
//! - Crash-safe compaction of sealed segments
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Engine (KvStore)                        │
//! │            (Single Writer / Multi Reader)                   │
//! └──────┬───────────────────┬─────────────────────┬────────────┘
//!        │                   │                     │
//!        ▼                   ▼                     ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────────┐
//! │  Workspace  │     │  KeyIndex   │     │    LogStore     │
//! │ LOCK + run- │     │  (RwLock)   │────▶│ segment_N.log   │
//! │ ning config │     │ key → loc   │     │ (append, pread) │
//! └─────────────┘     └─────────────┘     └────────┬────────┘
//!                                                  │
//!                                         ┌────────▼────────┐
//!                                         │  Maintenance    │
//!                                         │ (checkpoint +   │
//!                                         │  compaction)    │
//!                                         └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use falconkv::{Engine, KvStore};
//!
//! # fn main() -> falconkv::Result<()> {
//! let engine = Engine::init("/var/lib/falconkv", "/var/lib/falconkv/running_config.json")?;
//! engine.put(b"inode:1", b"root")?;
//! assert_eq!(engine.get(b"inode:1")?, Some(b"root".to_vec()));
//! engine.shutdown()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod engine;
pub mod index;
pub mod log;
mod maintenance;
pub mod workspace;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Config, ConfigCorruptPolicy, SyncStrategy};
pub use engine::{Engine, EngineStats, KvStore, RecoveryMode, RecoveryReport};
pub use error::{KvError, Result};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of FalconKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
