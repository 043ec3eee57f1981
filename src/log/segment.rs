//! Segment files
//!
//! A segment is a bounded-size slice of the log: a fixed header followed by
//! entries. Only the newest segment is ever appended to; every other segment
//! is sealed and immutable until compaction replaces it wholesale.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use crate::error::{KvError, Result};

use super::{LogEntry, Location};

/// Magic bytes identifying a FalconKV segment file
const SEGMENT_MAGIC: &[u8; 4] = b"FKVS";

/// Current segment format version
const SEGMENT_VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + Id (8) + CoversFrom (8) + StartSeq (8) + CRC (4)
pub const SEGMENT_HEADER_SIZE: u64 = 34;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXTENSION: &str = "log";

/// Suffix of a compaction output that has not been swapped in yet
pub(crate) const COMPACT_SUFFIX: &str = ".compact";

/// Segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Id of this segment; matches the file name
    pub segment_id: u64,
    /// Lowest segment id whose contents this file replaces. Equal to
    /// `segment_id` for ordinary segments; lower for compaction output.
    pub covers_from: u64,
    /// Sequence number the next appended entry received when this segment was
    /// created. Every entry in any later segment is at or above it.
    pub start_seq: u64,
}

impl SegmentHeader {
    pub fn new(segment_id: u64, start_seq: u64) -> Self {
        Self {
            segment_id,
            covers_from: segment_id,
            start_seq,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_SIZE as usize);
        buf.put_slice(SEGMENT_MAGIC);
        buf.put_u16_le(SEGMENT_VERSION);
        buf.put_u64_le(self.segment_id);
        buf.put_u64_le(self.covers_from);
        buf.put_u64_le(self.start_seq);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < SEGMENT_HEADER_SIZE as usize {
            return Err(KvError::Corruption("segment header truncated".into()));
        }
        let body = &data[..SEGMENT_HEADER_SIZE as usize - 4];
        let mut buf = data;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != SEGMENT_MAGIC {
            return Err(KvError::Corruption("bad segment magic".into()));
        }
        let version = buf.get_u16_le();
        if version != SEGMENT_VERSION {
            return Err(KvError::Corruption(format!(
                "unsupported segment version {}",
                version
            )));
        }
        let segment_id = buf.get_u64_le();
        let covers_from = buf.get_u64_le();
        let start_seq = buf.get_u64_le();
        let stored_crc = buf.get_u32_le();
        if crc32fast::hash(body) != stored_crc {
            return Err(KvError::Corruption("segment header checksum mismatch".into()));
        }
        if covers_from > segment_id {
            return Err(KvError::Corruption(format!(
                "segment {} claims to cover from later id {}",
                segment_id, covers_from
            )));
        }
        Ok(Self {
            segment_id,
            covers_from,
            start_seq,
        })
    }

    /// Read and validate the header of the segment at `path`
    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut buf = vec![0u8; SEGMENT_HEADER_SIZE as usize];
        file.read_exact_at(&mut buf, 0).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                KvError::Corruption(format!("segment header truncated: {}", path.display()))
            } else {
                KvError::Io(e)
            }
        })?;
        Self::decode(&buf)
    }
}

// =============================================================================
// File Naming
// =============================================================================

/// "segment_0000000042.log" for id 42
pub fn segment_file_name(id: u64) -> String {
    format!("{}{:010}.{}", SEGMENT_PREFIX, id, SEGMENT_EXTENSION)
}

/// Parse the segment id from a file name; `None` for anything else
/// (including in-progress compaction output)
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix(SEGMENT_PREFIX)?.parse().ok()
}

pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(segment_file_name(id))
}

pub(crate) fn compact_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{}", segment_file_name(id), COMPACT_SUFFIX))
}

/// fsync a directory so renames and creations inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

// =============================================================================
// Writer
// =============================================================================

/// Appends encoded entries to one segment file
pub struct SegmentWriter {
    header: SegmentHeader,
    path: PathBuf,
    file: File,
    /// Current length of the file
    size: u64,
    /// Set when a failed append could not be rolled back
    poisoned: Option<String>,
}

impl SegmentWriter {
    /// Create a new segment file containing only the header
    ///
    /// A leftover file at `path` that is no longer than a header (an earlier
    /// creation that failed part way) holds no entries and is replaced. On
    /// failure the new file is removed again, so a retry can succeed.
    pub fn create(path: &Path, header: SegmentHeader) -> Result<Self> {
        let mut file = match OpenOptions::new().create_new(true).append(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let len = fs::metadata(path)?.len();
                if len > SEGMENT_HEADER_SIZE {
                    return Err(KvError::Io(e));
                }
                warn!(path = %path.display(), len, "Replacing leftover segment without entries");
                fs::remove_file(path)?;
                OpenOptions::new().create_new(true).append(true).open(path)?
            }
            Err(e) => return Err(KvError::Io(e)),
        };
        if let Err(e) = Self::write_header(&mut file, path, &header) {
            if let Err(cleanup) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %cleanup, "Failed to remove partial segment");
            }
            return Err(e);
        }
        debug!(
            segment_id = header.segment_id,
            covers_from = header.covers_from,
            start_seq = header.start_seq,
            "Created segment"
        );
        Ok(Self {
            header,
            path: path.to_path_buf(),
            file,
            size: SEGMENT_HEADER_SIZE,
            poisoned: None,
        })
    }

    fn write_header(file: &mut File, path: &Path, header: &SegmentHeader) -> Result<()> {
        file.write_all(&header.encode())?;
        file.sync_all()?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }

    /// Reopen an existing (already recovered) segment for appending
    pub fn open(path: &Path, header: SegmentHeader, size: u64) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        let actual = file.metadata()?.len();
        if actual != size {
            return Err(KvError::Corruption(format!(
                "segment {} is {} bytes, expected {}",
                header.segment_id, actual, size
            )));
        }
        Ok(Self {
            header,
            path: path.to_path_buf(),
            file,
            size,
            poisoned: None,
        })
    }

    /// Append one encoded entry; returns its offset
    ///
    /// On failure the file is truncated back to its previous length so later
    /// appends never land behind garbage. If that also fails the writer is
    /// poisoned.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        if let Some(reason) = &self.poisoned {
            return Err(KvError::WriterPoisoned(reason.clone()));
        }
        let offset = self.size;
        if let Err(e) = self.file.write_all(bytes) {
            self.rollback(offset);
            return Err(KvError::Io(e));
        }
        self.size += bytes.len() as u64;
        Ok(offset)
    }

    /// Undo everything written after `offset`
    pub fn rollback(&mut self, offset: u64) {
        match self.file.set_len(offset) {
            Ok(()) => self.size = offset,
            Err(e) => {
                let reason = format!(
                    "segment {} could not be rolled back to {}: {}",
                    self.header.segment_id, offset, e
                );
                warn!(segment_id = self.header.segment_id, error = %e, "Log writer poisoned");
                self.poisoned = Some(reason);
            }
        }
    }

    /// Force written data to disk
    pub fn sync(&mut self) -> Result<()> {
        if let Some(reason) = &self.poisoned {
            return Err(KvError::WriterPoisoned(reason.clone()));
        }
        self.file.sync_data()?;
        Ok(())
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn id(&self) -> u64 {
        self.header.segment_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Positional reader over one segment file
///
/// Uses `pread`, so any number of threads can read concurrently without
/// sharing a cursor.
#[derive(Debug)]
pub struct SegmentReader {
    header: SegmentHeader,
    path: PathBuf,
    file: File,
}

impl SegmentReader {
    /// Open a segment and validate its header
    pub fn open(path: &Path) -> Result<Self> {
        let header = SegmentHeader::read_from(path)?;
        let file = File::open(path)?;
        Ok(Self {
            header,
            path: path.to_path_buf(),
            file,
        })
    }

    /// Read and verify the entry at `location`
    pub fn read_entry(&self, location: &Location) -> Result<LogEntry> {
        if location.segment_id != self.header.segment_id {
            return Err(KvError::Corruption(format!(
                "location in segment {} read from segment {}",
                location.segment_id, self.header.segment_id
            )));
        }
        let mut buf = vec![0u8; location.len as usize];
        self.file
            .read_exact_at(&mut buf, location.offset)
            .map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    KvError::Corruption(format!(
                        "entry at {}:{} extends past end of segment",
                        location.segment_id, location.offset
                    ))
                } else {
                    KvError::Io(e)
                }
            })?;
        LogEntry::deserialize(&buf)
    }

    /// Current file length
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Independent handle for scanning; keeps the file readable even after
    /// compaction unlinks it
    pub(crate) fn try_clone_file(&self) -> Result<File> {
        Ok(self.file.try_clone()?)
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn id(&self) -> u64 {
        self.header.segment_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Remove a segment file, syncing its directory afterwards
pub(crate) fn remove_segment(path: &Path) -> Result<()> {
    fs::remove_file(path)?;
    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}
