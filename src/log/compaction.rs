//! Segment Compaction
//!
//! Rewrites the live entries of the oldest sealed segments into one fresh
//! segment and swaps it in atomically.
//!
//! ## Crash Safety
//! 1. Live entries are written to `segment_<last>.log.compact` and fsynced
//! 2. The temp file is renamed over `segment_<last>.log` (atomic replace);
//!    its header says it covers `[first, last]`
//! 3. The other run members are deleted
//!
//! A crash before (2) leaves a `.compact` file that recovery deletes. A crash
//! between (2) and (3) leaves stale members that recovery deletes because a
//! later header covers them. Old segments are never edited in place.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{KvError, Result};

use super::segment::{compact_path, remove_segment, segment_path};
use super::{
    Location, LogStore, ScanStep, SegmentHeader, SegmentReader, SegmentScanner, SegmentWriter,
    SEGMENT_HEADER_SIZE,
};

/// Segments selected for one compaction
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPlan {
    /// Contiguous, oldest-first segment ids
    pub run: Vec<u64>,
    /// Entry bytes in the run (headers excluded)
    pub total_bytes: u64,
    /// Bytes of entries the index still points to
    pub live_bytes: u64,
}

impl CompactionPlan {
    /// Fraction of the run's entry bytes that is dead
    pub fn garbage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        1.0 - self.live_bytes as f64 / self.total_bytes as f64
    }

    /// Whether running the plan would change anything on disk
    pub fn is_worthwhile(&self) -> bool {
        self.run.len() > 1 || self.live_bytes < self.total_bytes
    }
}

/// Outcome of one compaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub segments_compacted: usize,
    pub entries_kept: u64,
    pub entries_dropped: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// Id of the segment holding the rewritten entries
    pub output_segment: Option<u64>,
}

/// (key, old location, new location)
pub type Relocation = (Vec<u8>, Location, Location);

impl LogStore {
    /// Pick the oldest run of sealed segments whose entries are all at or
    /// below `durable_sequence`
    ///
    /// `live_bytes` maps segment id to the bytes of entries the index still
    /// references there.
    pub fn plan_compaction(
        &self,
        durable_sequence: u64,
        live_bytes: &HashMap<u64, u64>,
    ) -> Result<Option<CompactionPlan>> {
        self.plan_run(durable_sequence, live_bytes, false)
    }

    /// Like [`plan_compaction`](Self::plan_compaction), but as if the active
    /// segment were already sealed
    ///
    /// Lets a caller decide whether sealing is worth it before creating a new
    /// segment. Appends must be quiesced for the answer to stay valid.
    pub fn plan_compaction_with_active(
        &self,
        durable_sequence: u64,
        live_bytes: &HashMap<u64, u64>,
    ) -> Result<Option<CompactionPlan>> {
        self.plan_run(durable_sequence, live_bytes, true)
    }

    fn plan_run(
        &self,
        durable_sequence: u64,
        live_bytes: &HashMap<u64, u64>,
        include_active: bool,
    ) -> Result<Option<CompactionPlan>> {
        let active_id = self.active_segment_id();
        let last_sequence = self.next_sequence() - 1;
        let segments = self.segments_snapshot();

        let mut plan = CompactionPlan {
            run: Vec::new(),
            total_bytes: 0,
            live_bytes: 0,
        };
        for (i, segment) in segments.iter().enumerate() {
            let is_active = segment.id() >= active_id;
            if is_active && !(include_active && segment.id() == active_id) {
                break;
            }
            // Every entry of `segment` is below the next segment's start_seq
            let highest = match segments.get(i + 1) {
                Some(next) => next.header().start_seq.saturating_sub(1),
                None => last_sequence,
            };
            if highest > durable_sequence {
                break;
            }
            let entry_bytes = segment.len()?.saturating_sub(SEGMENT_HEADER_SIZE);
            if is_active && entry_bytes == 0 {
                break;
            }
            plan.run.push(segment.id());
            plan.total_bytes += entry_bytes;
            plan.live_bytes += live_bytes.get(&segment.id()).copied().unwrap_or(0);
            if is_active {
                break;
            }
        }

        Ok(if plan.run.is_empty() { None } else { Some(plan) })
    }

    /// Execute `plan`
    ///
    /// `is_live` decides which Put entries survive (tombstones never do: the
    /// run always starts at the oldest segment, so nothing older remains for
    /// them to shadow). `relocate` receives the moved entries while the
    /// segment table is exclusively held and must update the index.
    pub fn compact<L, R>(
        &self,
        plan: &CompactionPlan,
        is_live: L,
        relocate: R,
    ) -> Result<CompactionStats>
    where
        L: Fn(&[u8], &Location) -> bool,
        R: FnOnce(Vec<Relocation>),
    {
        let (first, last) = match (plan.run.first(), plan.run.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Ok(CompactionStats::default()),
        };

        let readers: Vec<Arc<SegmentReader>> = self
            .segments_snapshot()
            .into_iter()
            .filter(|r| plan.run.contains(&r.id()))
            .collect();
        if readers.len() != plan.run.len() {
            // Another compaction already consumed part of the run
            return Ok(CompactionStats::default());
        }

        let tmp = compact_path(self.dir(), last);
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        let header = SegmentHeader {
            segment_id: last,
            covers_from: first,
            start_seq: readers[0].header().start_seq,
        };

        let mut stats = CompactionStats {
            segments_compacted: readers.len(),
            output_segment: Some(last),
            ..Default::default()
        };
        let relocations = match Self::rewrite(&readers, &tmp, header, &is_live, &mut stats) {
            Ok(relocations) => relocations,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&tmp) {
                    warn!(path = %tmp.display(), error = %cleanup, "Failed to remove compaction output");
                }
                return Err(e);
            }
        };

        // Point of no return: the rename is the atomic swap on disk
        let target = segment_path(self.dir(), last);
        fs::rename(&tmp, &target)?;
        self.sync_dir()?;
        let output = Arc::new(SegmentReader::open(&target)?);
        stats.bytes_after = output.len()?;
        self.swap_segments(&plan.run, output, || relocate(relocations));

        for id in &plan.run[..plan.run.len() - 1] {
            remove_segment(&segment_path(self.dir(), *id))?;
        }

        info!(
            first,
            last,
            kept = stats.entries_kept,
            dropped = stats.entries_dropped,
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "Compacted log segments"
        );
        Ok(stats)
    }

    /// Copy live entries of `readers` into a new file at `tmp`
    fn rewrite<L>(
        readers: &[Arc<SegmentReader>],
        tmp: &std::path::Path,
        header: SegmentHeader,
        is_live: &L,
        stats: &mut CompactionStats,
    ) -> Result<Vec<Relocation>>
    where
        L: Fn(&[u8], &Location) -> bool,
    {
        let mut writer = SegmentWriter::create(tmp, header)?;
        let mut relocations = Vec::new();

        for reader in readers {
            let end = reader.len()?;
            stats.bytes_before += end;
            let mut scanner = SegmentScanner::new(reader.try_clone_file()?, reader.id(), end);
            loop {
                match scanner.next_step()? {
                    ScanStep::Entry { location, entry } => {
                        if entry.is_tombstone() || !is_live(entry.key(), &location) {
                            stats.entries_dropped += 1;
                            continue;
                        }
                        let bytes = entry.serialize()?;
                        let offset = writer.append(&bytes)?;
                        let moved = Location {
                            segment_id: header.segment_id,
                            offset,
                            len: bytes.len() as u32,
                        };
                        stats.entries_kept += 1;
                        relocations.push((entry.key().to_vec(), location, moved));
                    }
                    ScanStep::End => break,
                    ScanStep::Truncated { offset } => {
                        return Err(KvError::Corruption(format!(
                            "sealed segment {} truncated at offset {}",
                            reader.id(),
                            offset
                        )))
                    }
                    ScanStep::Corrupted { offset, reason } => {
                        return Err(KvError::Corruption(format!(
                            "sealed segment {} offset {}: {}",
                            reader.id(),
                            offset,
                            reason
                        )))
                    }
                }
            }
        }

        writer.sync()?;
        Ok(relocations)
    }
}
