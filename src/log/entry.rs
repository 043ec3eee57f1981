//! Log Entry definitions
//!
//! Defines the structure and wire encoding of individual log entries.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Entry header size: Seq (8) + CRC (4) + Len (4) = 16 bytes
pub const HEADER_SIZE: usize = 16;

/// A single entry in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Sequence number - strictly increasing across the whole log
    pub sequence: u64,

    /// The operation recorded
    pub operation: Operation,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key (tombstone)
    Delete { key: Vec<u8> },
}

/// Part of the entry covered by bincode; sequence and length live in the header
#[derive(Serialize, Deserialize)]
struct Payload {
    operation: Operation,
    timestamp: u64,
}

/// Parsed fixed-size entry header
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader {
    pub sequence: u64,
    pub crc: u32,
    pub payload_len: u32,
}

impl EntryHeader {
    pub(crate) fn parse(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_SIZE);
        let sequence = buf.get_u64_le();
        let crc = buf.get_u32_le();
        let payload_len = buf.get_u32_le();
        Self {
            sequence,
            crc,
            payload_len,
        }
    }

    pub(crate) fn entry_len(&self) -> u64 {
        HEADER_SIZE as u64 + self.payload_len as u64
    }
}

impl Operation {
    /// The key this operation targets
    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Put { key, .. } | Operation::Delete { key } => key,
        }
    }
}

impl LogEntry {
    /// Create an entry stamped with the current wall-clock time
    pub fn new(sequence: u64, operation: Operation) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            sequence,
            operation,
            timestamp,
        }
    }

    pub fn key(&self) -> &[u8] {
        self.operation.key()
    }

    /// The stored value; `None` for tombstones
    pub fn value(&self) -> Option<&[u8]> {
        match &self.operation {
            Operation::Put { value, .. } => Some(value),
            Operation::Delete { .. } => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.operation, Operation::Delete { .. })
    }

    /// Serialize to `[seq][crc][len][payload]`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&Payload {
            operation: self.operation.clone(),
            timestamp: self.timestamp,
        })?;
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            KvError::InvalidArgument(format!("entry payload of {} bytes too large", payload.len()))
        })?;

        let crc = compute_crc(self.sequence, payload_len, &payload);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u64_le(self.sequence);
        buf.put_u32_le(crc);
        buf.put_u32_le(payload_len);
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    /// Deserialize one complete entry; `buf` must hold exactly one entry
    ///
    /// Any mismatch (short buffer, length disagreement, CRC, payload decode)
    /// is reported as `Corruption`.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(KvError::Corruption(format!(
                "entry of {} bytes shorter than header",
                buf.len()
            )));
        }
        let header = EntryHeader::parse(&buf[..HEADER_SIZE]);
        if header.entry_len() != buf.len() as u64 {
            return Err(KvError::Corruption(format!(
                "entry length {} does not match header length {}",
                buf.len(),
                header.entry_len()
            )));
        }
        Self::from_parts(&header, &buf[HEADER_SIZE..])
    }

    /// Verify the checksum and decode the payload belonging to `header`
    pub(crate) fn from_parts(header: &EntryHeader, payload: &[u8]) -> Result<Self> {
        let computed = compute_crc(header.sequence, header.payload_len, payload);
        if computed != header.crc {
            return Err(KvError::Corruption(format!(
                "checksum mismatch for sequence {}: stored {:#010x}, computed {:#010x}",
                header.sequence, header.crc, computed
            )));
        }
        let decoded: Payload = bincode::deserialize(payload).map_err(|e| {
            KvError::Corruption(format!(
                "undecodable payload for sequence {}: {}",
                header.sequence, e
            ))
        })?;
        Ok(Self {
            sequence: header.sequence,
            operation: decoded.operation,
            timestamp: decoded.timestamp,
        })
    }
}

/// CRC over sequence, payload length and payload
fn compute_crc(sequence: u64, payload_len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(&payload_len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}
