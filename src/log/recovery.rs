//! Log Recovery
//!
//! Rebuilds a consistent log from whatever a crash left on disk.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{KvError, Result};

use super::segment::{self, sync_dir, COMPACT_SUFFIX};
use super::{
    parse_segment_id, LogEntry, Location, ScanStep, SegmentHeader, SegmentScanner,
    SEGMENT_HEADER_SIZE,
};

/// What recovery may assume about the log
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryPlan {
    /// Highest sequence number known to be durable (from a trusted checkpoint).
    /// Losing any entry at or below it is corruption, not a torn write.
    pub durable_sequence: Option<u64>,
}

/// Handles log recovery after a crash
pub struct LogRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of complete entries that failed validation (0 or 1: the first
    /// invalid entry ends the log)
    pub entries_corrupted: u64,

    /// Last valid sequence number (0 for an empty log)
    pub last_sequence: u64,

    /// Whether bytes past the effective end were found (and, for `recover`,
    /// discarded)
    pub was_truncated: bool,

    /// Bytes past the effective end of the log
    pub bytes_discarded: u64,

    /// Segment files removed: torn creations, stale compaction inputs and
    /// segments past the effective end
    pub segments_removed: u64,
}

/// A segment that survived recovery
#[derive(Debug, Clone)]
pub struct RecoveredSegment {
    pub header: SegmentHeader,
    pub path: PathBuf,
    /// Valid length in bytes
    pub len: u64,
}

/// The log as recovery left it
#[derive(Debug, Clone)]
pub struct RecoveredLog {
    /// Surviving segments, ascending by id
    pub segments: Vec<RecoveredSegment>,
    /// Sequence number the next append must use
    pub next_sequence: u64,
}

/// Planned fix-ups, computed before anything on disk is touched
#[derive(Default)]
struct Repair {
    remove: Vec<PathBuf>,
    truncate: Option<(PathBuf, u64)>,
}

impl LogRecovery {
    /// Recover the log in `dir`, calling `on_entry` for every valid entry in
    /// sequence order
    ///
    /// This will:
    /// 1. Delete unfinished compaction output and stale compaction inputs
    /// 2. Validate every entry of every segment
    /// 3. Truncate at the first torn or invalid entry, dropping later segments
    /// 4. Return the surviving segments
    pub fn recover<F>(
        dir: &Path,
        plan: RecoveryPlan,
        on_entry: F,
    ) -> Result<(RecoveredLog, RecoveryResult)>
    where
        F: FnMut(Location, &LogEntry),
    {
        fs::create_dir_all(dir)?;
        let (log, result, repair) = Self::scan(dir, plan, on_entry)?;

        let repaired = !repair.remove.is_empty() || repair.truncate.is_some();
        if let Some((path, len)) = &repair.truncate {
            warn!(
                path = %path.display(),
                valid_len = len,
                bytes_discarded = result.bytes_discarded,
                "Truncating log at first invalid entry"
            );
            let file = fs::OpenOptions::new().write(true).open(path)?;
            file.set_len(*len)?;
            file.sync_all()?;
        }
        for path in &repair.remove {
            info!(path = %path.display(), "Removing segment");
            fs::remove_file(path)?;
        }
        if repaired {
            sync_dir(dir)?;
        }

        info!(
            entries_recovered = result.entries_recovered,
            entries_corrupted = result.entries_corrupted,
            last_sequence = result.last_sequence,
            was_truncated = result.was_truncated,
            segments = log.segments.len(),
            "Log recovery complete"
        );
        Ok((log, result))
    }

    /// Verify integrity of a log directory without modifying it
    pub fn verify(dir: &Path) -> Result<RecoveryResult> {
        if !dir.exists() {
            return Ok(RecoveryResult::default());
        }
        let (_, result, _) = Self::scan(dir, RecoveryPlan::default(), |_, _| {})?;
        Ok(result)
    }

    /// Read-only pass shared by `recover` and `verify`
    fn scan<F>(
        dir: &Path,
        plan: RecoveryPlan,
        mut on_entry: F,
    ) -> Result<(RecoveredLog, RecoveryResult, Repair)>
    where
        F: FnMut(Location, &LogEntry),
    {
        let mut result = RecoveryResult::default();
        let mut repair = Repair::default();

        // Step 1: discover segment files
        let mut ids = BTreeSet::new();
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.to_string_lossy().ends_with(COMPACT_SUFFIX) {
                debug!(path = %path.display(), "Discarding unfinished compaction output");
                repair.remove.push(path);
                continue;
            }
            if let Some(id) = parse_segment_id(&path) {
                ids.insert(id);
            }
        }

        // Step 2: read headers; a torn header is only legal on the newest file
        let last_id = ids.iter().next_back().copied();
        let mut headers = Vec::with_capacity(ids.len());
        for &id in &ids {
            let path = segment::segment_path(dir, id);
            match SegmentHeader::read_from(&path) {
                Ok(header) if header.segment_id == id => headers.push((header, path)),
                Ok(header) => {
                    return Err(KvError::Corruption(format!(
                        "segment file {} carries id {}",
                        path.display(),
                        header.segment_id
                    )))
                }
                Err(KvError::Corruption(reason))
                    if Some(id) == last_id
                        && fs::metadata(&path)?.len() <= SEGMENT_HEADER_SIZE =>
                {
                    warn!(segment_id = id, %reason, "Discarding segment with torn header");
                    repair.remove.push(path);
                    result.segments_removed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        // Step 3: drop inputs of a compaction whose output was already swapped in
        let mut superseded = BTreeSet::new();
        for (header, _) in &headers {
            superseded.extend(header.covers_from..header.segment_id);
        }
        headers.retain(|(header, path)| {
            if superseded.contains(&header.segment_id) {
                info!(segment_id = header.segment_id, "Discarding segment replaced by compaction");
                repair.remove.push(path.clone());
                result.segments_removed += 1;
                false
            } else {
                true
            }
        });

        // Step 4: validate entries in order until the first bad one
        let mut segments = Vec::with_capacity(headers.len());
        let mut last_sequence = 0u64;
        let mut end_found = false;
        for (header, path) in headers {
            if end_found {
                result.bytes_discarded += fs::metadata(&path)?.len();
                result.segments_removed += 1;
                repair.remove.push(path);
                continue;
            }

            let mut scanner = SegmentScanner::open(&path)?;
            let file_len = fs::metadata(&path)?.len();
            let valid_len = loop {
                match scanner.next_step()? {
                    ScanStep::Entry { location, entry } => {
                        if entry.sequence <= last_sequence {
                            warn!(
                                segment_id = header.segment_id,
                                offset = location.offset,
                                sequence = entry.sequence,
                                previous = last_sequence,
                                "Sequence number regression"
                            );
                            result.entries_corrupted += 1;
                            break location.offset;
                        }
                        last_sequence = entry.sequence;
                        result.entries_recovered += 1;
                        on_entry(location, &entry);
                    }
                    ScanStep::End => break scanner.offset(),
                    ScanStep::Truncated { offset } => break offset,
                    ScanStep::Corrupted { offset, reason } => {
                        warn!(segment_id = header.segment_id, offset, %reason, "Invalid log entry");
                        result.entries_corrupted += 1;
                        break offset;
                    }
                }
            };

            if valid_len < file_len {
                end_found = true;
                result.was_truncated = true;
                result.bytes_discarded += file_len - valid_len;
                repair.truncate = Some((path.clone(), valid_len));
            }
            segments.push(RecoveredSegment {
                header,
                path,
                len: valid_len,
            });
        }

        // Step 5: the surviving log must still reach the durable checkpoint.
        // Compaction may have dropped superseded entries at the tail of a
        // sealed segment, but the following segment's start_seq still
        // records how far the log had advanced.
        let max_start = segments.iter().map(|s| s.header.start_seq).max().unwrap_or(0);
        let durable_end = last_sequence.max(max_start.saturating_sub(1));
        if let Some(durable) = plan.durable_sequence {
            if durable_end < durable {
                return Err(KvError::Corruption(format!(
                    "log ends at sequence {} but checkpoint recorded {} as durable",
                    durable_end, durable
                )));
            }
        }

        result.last_sequence = last_sequence;
        let next_sequence = (last_sequence + 1).max(max_start).max(1);
        Ok((
            RecoveredLog {
                segments,
                next_sequence,
            },
            result,
            repair,
        ))
    }
}
