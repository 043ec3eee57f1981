//! Tests for the Log Store
//!
//! These tests verify:
//! - Append assigns strictly increasing sequence numbers
//! - Entries are readable at the returned location
//! - Rotation into multiple segments, surviving reopen
//! - `read_from` is lazy, bounded by the tail, and restartable

use std::fs;
use std::path::PathBuf;

use falconkv::config::SyncStrategy;
use falconkv::log::{segment_file_name, LogOptions, LogStore, Operation, RecoveryPlan};
use falconkv::KvError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_log() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("segments");
    (temp_dir, dir)
}

fn options(segment_size_limit: u64) -> LogOptions {
    LogOptions {
        sync_strategy: SyncStrategy::EveryWrite,
        segment_size_limit,
        min_next_sequence: 1,
    }
}

fn open_store(dir: &PathBuf, segment_size_limit: u64) -> LogStore {
    let (store, _) =
        LogStore::open(dir, options(segment_size_limit), RecoveryPlan::default(), |_, _| {})
            .unwrap();
    store
}

/// 60-byte entries: 6-byte key, 10-byte value
fn put(i: usize) -> Operation {
    Operation::Put {
        key: format!("key_{:02}", i).into_bytes(),
        value: format!("value_{:04}", i).into_bytes(),
    }
}

// =============================================================================
// Append Tests
// =============================================================================

#[test]
fn test_open_creates_first_segment() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 1024 * 1024);

    assert_eq!(store.segment_ids(), vec![1]);
    assert_eq!(store.next_sequence(), 1);
    assert!(dir.join("segment_0000000001.log").exists());
}

#[test]
fn test_append_assigns_increasing_sequences() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 1024 * 1024);

    let sequences: Vec<u64> = (0..5).map(|i| store.append(put(i)).unwrap().sequence).collect();

    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    assert_eq!(store.tail().sequence, 5);
    assert_eq!(store.next_sequence(), 6);
}

#[test]
fn test_read_entry_at_returned_location() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 1024 * 1024);

    let first = store.append(put(1)).unwrap();
    let second = store.append(Operation::Delete { key: b"key_01".to_vec() }).unwrap();

    let entry = store.read_entry(&first.location).unwrap();
    assert_eq!(entry.sequence, first.sequence);
    assert_eq!(entry.value(), Some(&b"value_0001"[..]));

    let tombstone = store.pin().read_entry(&second.location).unwrap();
    assert!(tombstone.is_tombstone());
}

#[test]
fn test_reopen_continues_sequence() {
    let (_temp, dir) = setup_temp_log();
    {
        let store = open_store(&dir, 1024 * 1024);
        for i in 0..3 {
            store.append(put(i)).unwrap();
        }
    }

    let mut replayed = Vec::new();
    let (store, result) = LogStore::open(
        &dir,
        options(1024 * 1024),
        RecoveryPlan::default(),
        |_, entry| replayed.push(entry.sequence),
    )
    .unwrap();

    assert_eq!(replayed, vec![1, 2, 3]);
    assert_eq!(result.entries_recovered, 3);
    assert_eq!(store.append(put(9)).unwrap().sequence, 4);
}

#[test]
fn test_min_next_sequence_floor() {
    let (_temp, dir) = setup_temp_log();
    let mut opts = options(1024 * 1024);
    opts.min_next_sequence = 100;
    let (store, _) = LogStore::open(&dir, opts, RecoveryPlan::default(), |_, _| {}).unwrap();

    assert_eq!(store.append(put(0)).unwrap().sequence, 100);
}

#[test]
fn test_every_n_sync_reports_durable_tail() {
    let (_temp, dir) = setup_temp_log();
    let opts = LogOptions {
        sync_strategy: SyncStrategy::EveryNEntries { count: 100 },
        segment_size_limit: 1024 * 1024,
        min_next_sequence: 1,
    };
    let (store, _) = LogStore::open(&dir, opts, RecoveryPlan::default(), |_, _| {}).unwrap();
    for i in 0..3 {
        store.append(put(i)).unwrap();
    }

    let durable = store.sync().unwrap();
    assert_eq!(durable, store.tail());
    assert_eq!(durable.sequence, 3);
}

// =============================================================================
// Rotation Tests
// =============================================================================

#[test]
fn test_rotation_splits_segments() {
    let (_temp, dir) = setup_temp_log();
    // Header (34) + two 60-byte entries fit; a third does not
    let store = open_store(&dir, 200);

    for i in 0..10 {
        store.append(put(i)).unwrap();
    }

    assert_eq!(store.segment_ids(), vec![1, 2, 3, 4, 5]);
    assert_eq!(store.active_segment_id(), 5);
}

#[test]
fn test_rotation_survives_reopen() {
    let (_temp, dir) = setup_temp_log();
    {
        let store = open_store(&dir, 200);
        for i in 0..10 {
            store.append(put(i)).unwrap();
        }
    }

    let mut keys = Vec::new();
    let (store, result) = LogStore::open(&dir, options(200), RecoveryPlan::default(), |_, e| {
        keys.push(e.key().to_vec())
    })
    .unwrap();

    assert_eq!(result.entries_recovered, 10);
    assert_eq!(keys[9], b"key_09".to_vec());
    assert_eq!(store.segment_count(), 5);
    assert_eq!(store.append(put(10)).unwrap().sequence, 11);
}

#[test]
fn test_rotate_replaces_leftover_without_entries() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 1024 * 1024);
    store.append(put(0)).unwrap();

    // What a creation that failed after the file appeared leaves behind
    fs::write(dir.join(segment_file_name(2)), [0xEE; 10]).unwrap();

    assert_eq!(store.rotate().unwrap(), 2);
    assert_eq!(store.append(put(1)).unwrap().location.segment_id, 2);
    drop(store);

    let (store, result) =
        LogStore::open(&dir, options(1024 * 1024), RecoveryPlan::default(), |_, _| {}).unwrap();
    assert_eq!(result.entries_recovered, 2);
    assert_eq!(store.segment_ids(), vec![1, 2]);
}

#[test]
fn test_rotate_keeps_existing_file_with_entries() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 1024 * 1024);
    store.append(put(0)).unwrap();
    let foreign = dir.join(segment_file_name(2));
    fs::write(&foreign, [0xEE; 100]).unwrap();

    assert!(matches!(store.rotate(), Err(KvError::Io(_))));

    // The failed rotation leaves the active segment usable
    assert_eq!(store.active_segment_id(), 1);
    assert_eq!(store.append(put(1)).unwrap().location.segment_id, 1);
    assert_eq!(fs::metadata(&foreign).unwrap().len(), 100);
}

#[test]
fn test_seal_active_only_when_non_empty() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 1024 * 1024);

    assert_eq!(store.seal_active().unwrap(), None);

    store.append(put(0)).unwrap();
    assert_eq!(store.seal_active().unwrap(), Some(2));
    assert_eq!(store.segment_ids(), vec![1, 2]);

    // The new segment starts where the log left off
    assert_eq!(store.append(put(1)).unwrap().location.segment_id, 2);
}

// =============================================================================
// read_from Tests
// =============================================================================

#[test]
fn test_read_from_is_restartable() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 200);
    for i in 0..10 {
        store.append(put(i)).unwrap();
    }

    let all: Vec<u64> = store
        .read_from(1)
        .unwrap()
        .map(|r| r.unwrap().1.sequence)
        .collect();
    assert_eq!(all, (1..=10).collect::<Vec<_>>());

    // Resume after the 5th entry, crossing segment boundaries
    let rest: Vec<u64> = store
        .read_from(6)
        .unwrap()
        .map(|r| r.unwrap().1.sequence)
        .collect();
    assert_eq!(rest, (6..=10).collect::<Vec<_>>());
}

#[test]
fn test_read_from_bounded_by_tail() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 200);
    for i in 0..3 {
        store.append(put(i)).unwrap();
    }

    let iter = store.read_from(1).unwrap();
    for i in 3..8 {
        store.append(put(i)).unwrap();
    }

    assert_eq!(iter.count(), 3);
}

#[test]
fn test_read_from_locations_match_entries() {
    let (_temp, dir) = setup_temp_log();
    let store = open_store(&dir, 200);
    for i in 0..6 {
        store.append(put(i)).unwrap();
    }

    for item in store.read_from(1).unwrap() {
        let (location, entry) = item.unwrap();
        assert_eq!(store.read_entry(&location).unwrap(), entry);
    }
}
