//! Log Store
//!
//! Owns the segment files of one workspace: the active writer and a reader
//! for every live segment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::config::SyncStrategy;
use crate::error::{KvError, Result};

use super::segment::{segment_path, sync_dir};
use super::{
    LogEntry, LogIterator, LogPosition, LogRecovery, Location, Operation, RecoveryPlan,
    RecoveryResult, SegmentHeader, SegmentReader, SegmentWriter, SEGMENT_HEADER_SIZE,
};

/// Tunables of the log store
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    pub sync_strategy: SyncStrategy,
    pub segment_size_limit: u64,
    /// Floor for the next sequence number (e.g. from a checkpoint), so numbers
    /// are never reused even if every entry was compacted away
    pub min_next_sequence: u64,
}

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub sequence: u64,
    pub location: Location,
}

/// The append side; everything here changes only under `LogStore::writer`
struct ActiveLog {
    segment: SegmentWriter,
    next_sequence: u64,
    writes_since_sync: usize,
}

/// Segmented append-only log
///
/// ## Concurrency:
/// - `writer`: Mutex - one append in flight at a time, so sequence numbers
///   are strictly increasing and writes never interleave
/// - `segments`: RwLock - readers pin the segment table for the duration of
///   a lookup+read; rotation and compaction take it exclusively and briefly
pub struct LogStore {
    dir: PathBuf,
    options: LogOptions,
    writer: Mutex<ActiveLog>,
    segments: RwLock<BTreeMap<u64, Arc<SegmentReader>>>,
}

/// A pinned, read-only view of the segment table
///
/// While a view is alive compaction cannot swap segments, so a location
/// looked up from the index stays readable.
pub struct SegmentsView<'a> {
    guard: RwLockReadGuard<'a, BTreeMap<u64, Arc<SegmentReader>>>,
}

impl SegmentsView<'_> {
    /// Read and verify the entry at `location`
    pub fn read_entry(&self, location: &Location) -> Result<LogEntry> {
        let reader = self.guard.get(&location.segment_id).ok_or_else(|| {
            KvError::Corruption(format!(
                "location refers to missing segment {}",
                location.segment_id
            ))
        })?;
        reader.read_entry(location)
    }
}

impl LogStore {
    /// Open or create the log in `dir`, recovering it first
    ///
    /// `on_entry` sees every surviving entry in sequence order.
    pub fn open<F>(
        dir: &Path,
        options: LogOptions,
        plan: RecoveryPlan,
        on_entry: F,
    ) -> Result<(Self, RecoveryResult)>
    where
        F: FnMut(Location, &LogEntry),
    {
        let (recovered, result) = LogRecovery::recover(dir, plan, on_entry)?;
        let next_sequence = recovered.next_sequence.max(options.min_next_sequence).max(1);

        let mut segments = BTreeMap::new();
        for segment in &recovered.segments {
            let reader = SegmentReader::open(&segment.path)?;
            segments.insert(segment.header.segment_id, Arc::new(reader));
        }

        // The newest surviving segment stays active; otherwise start one
        let active = match recovered.segments.last() {
            Some(last) => SegmentWriter::open(&last.path, last.header, last.len)?,
            None => {
                let header = SegmentHeader::new(1, next_sequence);
                let writer = SegmentWriter::create(&segment_path(dir, 1), header)?;
                segments.insert(1, Arc::new(SegmentReader::open(writer.path())?));
                writer
            }
        };

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            active_segment = active.id(),
            next_sequence,
            "Log opened"
        );

        Ok((
            Self {
                dir: dir.to_path_buf(),
                options,
                writer: Mutex::new(ActiveLog {
                    segment: active,
                    next_sequence,
                    writes_since_sync: 0,
                }),
                segments: RwLock::new(segments),
            },
            result,
        ))
    }

    /// Append an operation; returns once it is durable per the sync strategy
    pub fn append(&self, operation: Operation) -> Result<Appended> {
        let mut active = self.writer.lock();

        let sequence = active.next_sequence;
        let bytes = LogEntry::new(sequence, operation).serialize()?;

        // Rotate before writing if this entry would overflow a non-empty segment
        if active.segment.size() > SEGMENT_HEADER_SIZE
            && active.segment.size() + bytes.len() as u64 > self.options.segment_size_limit
        {
            self.rotate_locked(&mut active)?;
        }

        let offset = active.segment.append(&bytes)?;
        active.writes_since_sync += 1;

        let must_sync = match self.options.sync_strategy {
            SyncStrategy::EveryWrite => true,
            SyncStrategy::EveryNEntries { count } => active.writes_since_sync >= count,
        };
        if must_sync {
            if let Err(e) = active.segment.sync() {
                // Not acknowledged, so it must not resurface on replay either
                active.segment.rollback(offset);
                return Err(e);
            }
            active.writes_since_sync = 0;
        }

        active.next_sequence += 1;
        Ok(Appended {
            sequence,
            location: Location {
                segment_id: active.segment.id(),
                offset,
                len: bytes.len() as u32,
            },
        })
    }

    /// Seal the active segment and start a new one
    pub fn rotate(&self) -> Result<u64> {
        let mut active = self.writer.lock();
        self.rotate_locked(&mut active)
    }

    fn rotate_locked(&self, active: &mut ActiveLog) -> Result<u64> {
        active.segment.sync()?;
        active.writes_since_sync = 0;

        let new_id = active.segment.id() + 1;
        let header = SegmentHeader::new(new_id, active.next_sequence);
        let writer = SegmentWriter::create(&segment_path(&self.dir, new_id), header)?;
        let reader = Arc::new(SegmentReader::open(writer.path())?);

        // Readers must be able to resolve the segment before anything lands in it
        self.segments.write().insert(new_id, reader);

        debug!(
            sealed = active.segment.id(),
            sealed_size = active.segment.size(),
            active = new_id,
            start_seq = header.start_seq,
            "Rotated log segment"
        );
        active.segment = writer;
        Ok(new_id)
    }

    /// Seal the active segment if it holds any entries
    pub fn seal_active(&self) -> Result<Option<u64>> {
        let mut active = self.writer.lock();
        if active.segment.size() <= SEGMENT_HEADER_SIZE {
            return Ok(None);
        }
        self.rotate_locked(&mut active).map(Some)
    }

    /// Force everything appended so far to disk; returns the durable tail
    pub fn sync(&self) -> Result<LogPosition> {
        let mut active = self.writer.lock();
        active.segment.sync()?;
        active.writes_since_sync = 0;
        Ok(Self::position(&active))
    }

    /// Current end of the log
    pub fn tail(&self) -> LogPosition {
        Self::position(&self.writer.lock())
    }

    fn position(active: &ActiveLog) -> LogPosition {
        LogPosition {
            segment_id: active.segment.id(),
            offset: active.segment.size(),
            sequence: active.next_sequence - 1,
        }
    }

    /// Sequence number the next append will receive
    pub fn next_sequence(&self) -> u64 {
        self.writer.lock().next_sequence
    }

    /// Pin the segment table for consistent index-then-log reads
    pub fn pin(&self) -> SegmentsView<'_> {
        SegmentsView {
            guard: self.segments.read(),
        }
    }

    /// Read a single entry
    pub fn read_entry(&self, location: &Location) -> Result<LogEntry> {
        self.pin().read_entry(location)
    }

    /// Lazy iterator over entries with `sequence >= start`, up to the
    /// current tail
    pub fn read_from(&self, start: u64) -> Result<LogIterator> {
        // Take the tail first: the segment table can only grow past it
        let tail = self.tail();
        let segments = self.segments.read();
        let mut snapshot = Vec::with_capacity(segments.len());
        for (&id, reader) in segments.range(..=tail.segment_id) {
            let end = if id == tail.segment_id {
                tail.offset
            } else {
                reader.len()?
            };
            snapshot.push((Arc::clone(reader), end));
        }
        Ok(LogIterator::new(snapshot, start))
    }

    /// Ids of all live segments, ascending
    pub fn segment_ids(&self) -> Vec<u64> {
        self.segments.read().keys().copied().collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Total bytes across all segment files
    pub fn total_bytes(&self) -> Result<u64> {
        let segments = self.segments.read();
        let mut total = 0;
        for reader in segments.values() {
            total += reader.len()?;
        }
        Ok(total)
    }

    /// Id of the segment currently being appended to
    pub fn active_segment_id(&self) -> u64 {
        self.writer.lock().segment.id()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Compaction Support
    // =========================================================================

    pub(super) fn segments_snapshot(&self) -> Vec<Arc<SegmentReader>> {
        self.segments.read().values().cloned().collect()
    }

    /// Atomically replace the segments `run` with `output`, running `relocate`
    /// while the table is still exclusively held
    pub(super) fn swap_segments<F>(
        &self,
        run: &[u64],
        output: Arc<SegmentReader>,
        relocate: F,
    ) where
        F: FnOnce(),
    {
        let mut segments = self.segments.write();
        for id in run {
            segments.remove(id);
        }
        segments.insert(output.id(), output);
        relocate();
    }

    pub(super) fn sync_dir(&self) -> Result<()> {
        sync_dir(&self.dir)
    }
}
