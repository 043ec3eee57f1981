//! In-Memory Index
//!
//! Maps every live key to the location of its newest Put in the log.
//!
//! ## Responsibilities
//! - O(1) point lookups without touching disk
//! - Last-write-wins rebuild from a log replay
//! - Compare-and-swap relocation for compaction
//! - Per-segment live byte accounting (drives compaction decisions)
//!
//! ## Data Structure Choice
//! HashMap wrapped in a parking_lot RwLock:
//! - Point operations only; the engine never needs ordered iteration
//! - Readers share the lock, writers are exclusive, so no lookup ever sees a
//!   half-applied upsert

mod table;

pub use table::KeyIndex;

use crate::log::Location;

/// Where the newest value of a key lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Sequence number of the Put that wrote the value
    pub sequence: u64,

    /// Location of that Put in the log
    pub location: Location,

    /// Length of the value in bytes
    pub value_len: usize,
}
