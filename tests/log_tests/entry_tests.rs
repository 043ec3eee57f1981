//! Tests for Log Entries
//!
//! These tests verify:
//! - Serialization layout (header + payload)
//! - Checksum validation on deserialize
//! - Tombstone accessors

use falconkv::log::{LogEntry, Operation, HEADER_SIZE};
use falconkv::KvError;

fn put_entry(sequence: u64) -> LogEntry {
    LogEntry::new(
        sequence,
        Operation::Put {
            key: b"inode:42".to_vec(),
            value: b"dentry".to_vec(),
        },
    )
}

// =============================================================================
// Serialization Tests
// =============================================================================

#[test]
fn test_serialize_header_layout() {
    let entry = put_entry(7);
    let bytes = entry.serialize().unwrap();

    assert!(bytes.len() > HEADER_SIZE);
    assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 7);
    let payload_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    assert_eq!(bytes.len(), HEADER_SIZE + payload_len);
}

#[test]
fn test_deserialize_restores_entry() {
    let entry = put_entry(3);
    let decoded = LogEntry::deserialize(&entry.serialize().unwrap()).unwrap();

    assert_eq!(decoded, entry);
    assert_eq!(decoded.key(), b"inode:42");
    assert_eq!(decoded.value(), Some(&b"dentry"[..]));
}

#[test]
fn test_empty_value_is_preserved() {
    let entry = LogEntry::new(
        1,
        Operation::Put {
            key: b"k".to_vec(),
            value: Vec::new(),
        },
    );
    let decoded = LogEntry::deserialize(&entry.serialize().unwrap()).unwrap();
    assert_eq!(decoded.value(), Some(&b""[..]));
    assert!(!decoded.is_tombstone());
}

#[test]
fn test_tombstone_has_no_value() {
    let entry = LogEntry::new(9, Operation::Delete { key: b"k".to_vec() });
    assert!(entry.is_tombstone());
    assert_eq!(entry.value(), None);
    assert_eq!(entry.key(), b"k");
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_deserialize_detects_flipped_payload_bit() {
    let mut bytes = put_entry(1).serialize().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    assert!(matches!(
        LogEntry::deserialize(&bytes),
        Err(KvError::Corruption(_))
    ));
}

#[test]
fn test_deserialize_detects_flipped_sequence() {
    let mut bytes = put_entry(1).serialize().unwrap();
    bytes[0] ^= 0x02;

    assert!(matches!(
        LogEntry::deserialize(&bytes),
        Err(KvError::Corruption(_))
    ));
}

#[test]
fn test_deserialize_rejects_length_mismatch() {
    let bytes = put_entry(1).serialize().unwrap();

    assert!(matches!(
        LogEntry::deserialize(&bytes[..bytes.len() - 1]),
        Err(KvError::Corruption(_))
    ));
    assert!(matches!(
        LogEntry::deserialize(&bytes[..HEADER_SIZE - 1]),
        Err(KvError::Corruption(_))
    ));
}
