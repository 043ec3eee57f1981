//! Durable Log & Segment Store
//!
//! The append-only log is the ground truth of the engine. Everything else
//! (the in-memory index, the running-config checkpoint) can be rebuilt from it.
//!
//! ## Responsibilities
//! - Append checksummed entries with strictly increasing sequence numbers
//! - Split the log into bounded-size segment files
//! - Crash recovery: truncate at the first torn or invalid entry
//! - Lazy, restartable reads from any sequence number
//! - Crash-safe compaction of sealed segments
//!
//! ## Segment File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Segment Header (34 bytes)                                    │
//! │ ┌──────────┬─────────┬────────┬─────────────┬──────────┬───┐ │
//! │ │Magic (4) │ Ver (2) │ Id (8) │CoversFrom(8)│StartSeq 8│CRC│ │
//! │ └──────────┴─────────┴────────┴─────────────┴──────────┴───┘ │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Entry 1                                                      │
//! │ ┌─────────┬─────────┬─────────┬────────────────────────────┐ │
//! │ │ Seq (8) │ CRC (4) │ Len (4) │ Payload (bincode)          │ │
//! │ └─────────┴─────────┴─────────┴────────────────────────────┘ │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Entry 2 ...                                                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod compaction;
mod entry;
mod reader;
mod recovery;
mod segment;
mod store;

pub use compaction::{CompactionPlan, CompactionStats, Relocation};
pub use entry::{LogEntry, Operation, HEADER_SIZE};
pub use reader::{LogIterator, ScanStep, SegmentScanner};
pub use recovery::{LogRecovery, RecoveredLog, RecoveredSegment, RecoveryPlan, RecoveryResult};
pub use segment::{
    parse_segment_id, segment_file_name, SegmentHeader, SegmentReader, SegmentWriter,
    SEGMENT_HEADER_SIZE,
};
pub use store::{Appended, LogOptions, LogStore, SegmentsView};

/// Physical address of an entry in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// Segment holding the entry
    pub segment_id: u64,
    /// Byte offset of the entry header inside the segment file
    pub offset: u64,
    /// Encoded length of the entry (header + payload)
    pub len: u32,
}

/// A point in the log: the byte tail of a segment and the last sequence
/// number written at or before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogPosition {
    pub segment_id: u64,
    pub offset: u64,
    pub sequence: u64,
}

/// Bincode overhead of a Put payload: variant tag (4) + two length
/// prefixes (8 + 8) + timestamp (8)
const PUT_PAYLOAD_OVERHEAD: u64 = 28;

/// Largest encoded entry for the given key/value limits
pub fn max_encoded_len(max_key_size: usize, max_value_size: usize) -> u64 {
    HEADER_SIZE as u64 + PUT_PAYLOAD_OVERHEAD + max_key_size as u64 + max_value_size as u64
}
