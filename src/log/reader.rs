//! Log Reader
//!
//! Sequential scanning of segments, used by recovery, compaction and the
//! public `read_from` iterator.

use std::collections::VecDeque;
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{KvError, Result};

use super::entry::EntryHeader;
use super::{LogEntry, Location, SegmentHeader, SegmentReader, HEADER_SIZE, SEGMENT_HEADER_SIZE};

/// Outcome of reading the next entry of a segment
#[derive(Debug)]
pub enum ScanStep {
    /// A complete entry with a valid checksum
    Entry { location: Location, entry: LogEntry },

    /// The scan reached its end bound exactly
    End,

    /// Bytes remain but do not form a complete entry (torn write)
    Truncated { offset: u64 },

    /// A complete entry failed validation
    Corrupted { offset: u64, reason: String },
}

/// Forward scanner over the entries of one segment
///
/// Reads with `pread`, so scanners never disturb each other or concurrent
/// point reads on the same file.
pub struct SegmentScanner {
    segment_id: u64,
    file: File,
    offset: u64,
    end: u64,
    done: bool,
}

impl SegmentScanner {
    /// Scan a whole segment file from just after its header
    pub fn open(path: &Path) -> Result<Self> {
        let header = SegmentHeader::read_from(path)?;
        let file = File::open(path)?;
        let end = file.metadata()?.len();
        Ok(Self::new(file, header.segment_id, end))
    }

    /// Scan an already-open segment up to `end`
    pub fn new(file: File, segment_id: u64, end: u64) -> Self {
        Self {
            segment_id,
            file,
            offset: SEGMENT_HEADER_SIZE,
            end,
            done: false,
        }
    }

    /// Offset of the next entry to be read
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next entry
    ///
    /// Only genuine I/O failures are returned as `Err`; damaged data is
    /// reported through `ScanStep` so the caller decides what it means.
    pub fn next_step(&mut self) -> Result<ScanStep> {
        if self.done || self.offset >= self.end {
            return Ok(ScanStep::End);
        }

        let offset = self.offset;
        let remaining = self.end - offset;
        if remaining < HEADER_SIZE as u64 {
            self.done = true;
            return Ok(ScanStep::Truncated { offset });
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        if !self.read_exact_at(&mut header_buf, offset)? {
            self.done = true;
            return Ok(ScanStep::Truncated { offset });
        }
        let header = EntryHeader::parse(&header_buf);

        let entry_len = header.entry_len();
        if entry_len > remaining {
            self.done = true;
            return Ok(ScanStep::Truncated { offset });
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        if !self.read_exact_at(&mut payload, offset + HEADER_SIZE as u64)? {
            self.done = true;
            return Ok(ScanStep::Truncated { offset });
        }

        match LogEntry::from_parts(&header, &payload) {
            Ok(entry) => {
                self.offset += entry_len;
                Ok(ScanStep::Entry {
                    location: Location {
                        segment_id: self.segment_id,
                        offset,
                        len: entry_len as u32,
                    },
                    entry,
                })
            }
            Err(KvError::Corruption(reason)) => {
                self.done = true;
                Ok(ScanStep::Corrupted { offset, reason })
            }
            Err(e) => Err(e),
        }
    }

    /// `Ok(false)` when the file ended early
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<bool> {
        match self.file.read_exact_at(buf, offset) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(KvError::Io(e)),
        }
    }
}

/// Lazy iterator over log entries with `sequence >= start`
///
/// Bounded by the log tail at the time it was created, so it is always
/// finite. Restart from any sequence number by creating a new iterator with
/// `LogStore::read_from(last_seen + 1)`.
pub struct LogIterator {
    pending: VecDeque<(Arc<SegmentReader>, u64)>,
    current: Option<SegmentScanner>,
    start_sequence: u64,
    finished: bool,
}

impl LogIterator {
    /// `segments` must be in ascending id order, each paired with the byte
    /// length that was valid when the snapshot was taken
    pub(crate) fn new(segments: Vec<(Arc<SegmentReader>, u64)>, start_sequence: u64) -> Self {
        // Segments entirely below `start_sequence` can be skipped: the next
        // segment's start_seq bounds every sequence in the one before it.
        let mut first = 0;
        for i in 0..segments.len().saturating_sub(1) {
            if segments[i + 1].0.header().start_seq <= start_sequence {
                first = i + 1;
            }
        }
        Self {
            pending: segments.into_iter().skip(first).collect(),
            current: None,
            start_sequence,
            finished: false,
        }
    }

    fn open_next(&mut self) -> Result<bool> {
        match self.pending.pop_front() {
            Some((reader, end)) => {
                let file = reader.try_clone_file()?;
                self.current = Some(SegmentScanner::new(file, reader.id(), end));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Iterator for LogIterator {
    type Item = Result<(Location, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.current.is_none() {
                match self.open_next() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.finished = true;
                        return None;
                    }
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }

            let scanner = self.current.as_mut()?;
            let segment_id = scanner.segment_id;
            match scanner.next_step() {
                Ok(ScanStep::Entry { location, entry }) => {
                    if entry.sequence >= self.start_sequence {
                        return Some(Ok((location, entry)));
                    }
                }
                Ok(ScanStep::End) => self.current = None,
                Ok(ScanStep::Truncated { offset }) => {
                    self.finished = true;
                    return Some(Err(KvError::Corruption(format!(
                        "segment {} truncated at offset {}",
                        segment_id, offset
                    ))));
                }
                Ok(ScanStep::Corrupted { offset, reason }) => {
                    self.finished = true;
                    return Some(Err(KvError::Corruption(format!(
                        "segment {} offset {}: {}",
                        segment_id, offset, reason
                    ))));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
