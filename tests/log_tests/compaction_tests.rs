//! Tests for Segment Compaction
//!
//! These tests verify:
//! - Planning only picks sealed segments covered by the checkpoint
//! - Only live puts survive; tombstones and overwritten values are dropped
//! - Reads through the index are identical before and after
//! - Crash leftovers (stale inputs) are cleaned up on reopen
//! - Sequence numbers keep increasing after everything is compacted

use std::fs;
use std::path::{Path, PathBuf};

use falconkv::config::SyncStrategy;
use falconkv::index::{IndexEntry, KeyIndex};
use falconkv::log::{
    segment_file_name, CompactionStats, LogOptions, LogStore, Operation, RecoveryPlan,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Header (34) + two 56-byte entries fit in a segment; a third does not
const SEGMENT_LIMIT: u64 = 200;

fn setup_temp_log() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("segments");
    (temp_dir, dir)
}

fn options() -> LogOptions {
    LogOptions {
        sync_strategy: SyncStrategy::EveryWrite,
        segment_size_limit: SEGMENT_LIMIT,
        min_next_sequence: 1,
    }
}

/// Open the store and rebuild an index from it
fn open_indexed(dir: &Path) -> (LogStore, KeyIndex) {
    let index = KeyIndex::new();
    let (store, _) =
        LogStore::open(dir, options(), RecoveryPlan::default(), |l, e| index.apply(l, e)).unwrap();
    (store, index)
}

fn put(store: &LogStore, index: &KeyIndex, key: &str, value: &str) {
    let appended = store
        .append(Operation::Put {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        })
        .unwrap();
    index.upsert(
        key.as_bytes().to_vec(),
        IndexEntry {
            sequence: appended.sequence,
            location: appended.location,
            value_len: value.len(),
        },
    );
}

fn delete(store: &LogStore, index: &KeyIndex, key: &str) {
    store
        .append(Operation::Delete {
            key: key.as_bytes().to_vec(),
        })
        .unwrap();
    index.remove(key.as_bytes());
}

fn get(store: &LogStore, index: &KeyIndex, key: &str) -> Option<Vec<u8>> {
    let segments = store.pin();
    let entry = index.lookup(key.as_bytes())?;
    let logged = segments.read_entry(&entry.location).unwrap();
    logged.value().map(|v| v.to_vec())
}

/// Seal, sync, and compact everything eligible
fn compact_all(store: &LogStore, index: &KeyIndex) -> CompactionStats {
    store.seal_active().unwrap();
    let durable = store.sync().unwrap();
    let plan = store
        .plan_compaction(durable.sequence, &index.live_bytes_by_segment())
        .unwrap()
        .expect("sealed segments to compact");
    store
        .compact(
            &plan,
            |key, location| index.points_to(key, location),
            |moves| {
                index.relocate_all(moves);
            },
        )
        .unwrap()
}

/// Four keys written three times each: 12 entries over 6 segments
fn write_rounds(store: &LogStore, index: &KeyIndex) {
    for round in 0..3 {
        for k in 0..4 {
            put(store, index, &format!("key_{}", k), &format!("round_{}", round));
        }
    }
}

// =============================================================================
// Planning Tests
// =============================================================================

#[test]
fn test_plan_excludes_active_segment() {
    let (_temp, dir) = setup_temp_log();
    let (store, index) = open_indexed(&dir);
    put(&store, &index, "key_0", "round_0");

    let plan = store
        .plan_compaction(store.tail().sequence, &index.live_bytes_by_segment())
        .unwrap();

    assert!(plan.is_none());
}

#[test]
fn test_plan_stops_at_checkpoint() {
    let (_temp, dir) = setup_temp_log();
    let (store, index) = open_indexed(&dir);
    for i in 0..6 {
        put(&store, &index, &format!("key_{}", i), "round_0");
    }
    // Segments: 1 = seq 1..2, 2 = seq 3..4, 3 (active) = seq 5..6
    assert_eq!(store.segment_ids(), vec![1, 2, 3]);
    let live = index.live_bytes_by_segment();

    let plan = store.plan_compaction(2, &live).unwrap().unwrap();
    assert_eq!(plan.run, vec![1]);

    let plan = store.plan_compaction(4, &live).unwrap().unwrap();
    assert_eq!(plan.run, vec![1, 2]);
    assert_eq!(plan.garbage_ratio(), 0.0);

    assert!(store.plan_compaction(1, &live).unwrap().is_none());
}

#[test]
fn test_plan_with_active_counts_the_active_segment() {
    let (_temp, dir) = setup_temp_log();
    let (store, index) = open_indexed(&dir);
    let live = index.live_bytes_by_segment();

    // Empty active segment: nothing to plan
    assert!(store
        .plan_compaction_with_active(store.tail().sequence, &live)
        .unwrap()
        .is_none());

    put(&store, &index, "key_0", "round_0");
    let live = index.live_bytes_by_segment();
    let plan = store
        .plan_compaction_with_active(store.tail().sequence, &live)
        .unwrap()
        .unwrap();
    assert_eq!(plan.run, vec![1]);
    assert!(!plan.is_worthwhile());

    put(&store, &index, "key_0", "round_1");
    let live = index.live_bytes_by_segment();
    let plan = store
        .plan_compaction_with_active(store.tail().sequence, &live)
        .unwrap()
        .unwrap();
    assert!(plan.is_worthwhile());
    assert!((plan.garbage_ratio() - 0.5).abs() < 1e-9);

    // Planning never seals
    assert_eq!(store.segment_ids(), vec![1]);
}

#[test]
fn test_plan_with_active_respects_checkpoint() {
    let (_temp, dir) = setup_temp_log();
    let (store, index) = open_indexed(&dir);
    for i in 0..3 {
        put(&store, &index, &format!("key_{}", i), "round_0");
    }
    // Segments: 1 = seq 1..2, 2 (active) = seq 3
    let live = index.live_bytes_by_segment();

    let plan = store.plan_compaction_with_active(2, &live).unwrap().unwrap();
    assert_eq!(plan.run, vec![1]);

    let plan = store.plan_compaction_with_active(3, &live).unwrap().unwrap();
    assert_eq!(plan.run, vec![1, 2]);
}

#[test]
fn test_plan_measures_garbage() {
    let (_temp, dir) = setup_temp_log();
    let (store, index) = open_indexed(&dir);
    write_rounds(&store, &index);
    store.seal_active().unwrap();

    let plan = store
        .plan_compaction(store.tail().sequence, &index.live_bytes_by_segment())
        .unwrap()
        .unwrap();

    assert_eq!(plan.run, vec![1, 2, 3, 4, 5, 6]);
    assert!(plan.is_worthwhile());
    // Only the last round (4 of 12 equal-sized entries) is live
    assert!((plan.garbage_ratio() - 2.0 / 3.0).abs() < 1e-9);
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_compaction_keeps_only_live_puts() {
    let (_temp, dir) = setup_temp_log();
    let (store, index) = open_indexed(&dir);
    write_rounds(&store, &index);

    let stats = compact_all(&store, &index);

    assert_eq!(stats.segments_compacted, 6);
    assert_eq!(stats.entries_kept, 4);
    assert_eq!(stats.entries_dropped, 8);
    assert!(stats.bytes_after < stats.bytes_before);
    assert_eq!(stats.output_segment, Some(6));
    assert_eq!(store.segment_ids(), vec![6, 7]);

    for k in 0..4 {
        assert_eq!(
            get(&store, &index, &format!("key_{}", k)),
            Some(b"round_2".to_vec())
        );
    }
    // Inputs other than the output's id are gone
    assert!(!dir.join(segment_file_name(1)).exists());
    assert!(dir.join(segment_file_name(6)).exists());
}

#[test]
fn test_compaction_drops_tombstones() {
    let (_temp, dir) = setup_temp_log();
    let (store, index) = open_indexed(&dir);
    put(&store, &index, "gone", "v");
    delete(&store, &index, "gone");
    put(&store, &index, "kept", "v");

    let stats = compact_all(&store, &index);

    assert_eq!(stats.entries_kept, 1);
    assert_eq!(stats.entries_dropped, 2);
    drop(store);

    let (store, index) = open_indexed(&dir);
    assert_eq!(get(&store, &index, "gone"), None);
    assert_eq!(get(&store, &index, "kept"), Some(b"v".to_vec()));
}

#[test]
fn test_compaction_result_survives_reopen() {
    let (_temp, dir) = setup_temp_log();
    {
        let (store, index) = open_indexed(&dir);
        write_rounds(&store, &index);
        compact_all(&store, &index);
    }

    let (store, index) = open_indexed(&dir);
    assert_eq!(index.len(), 4);
    for k in 0..4 {
        assert_eq!(
            get(&store, &index, &format!("key_{}", k)),
            Some(b"round_2".to_vec())
        );
    }
    // Sequence numbers never go back
    assert_eq!(store.next_sequence(), 13);
}

#[test]
fn test_stale_inputs_removed_on_reopen() {
    let (temp, dir) = setup_temp_log();
    let backup = temp.path().join("backup");
    fs::create_dir_all(&backup).unwrap();
    {
        let (store, index) = open_indexed(&dir);
        write_rounds(&store, &index);
        store.seal_active().unwrap();
        for id in 1..=5 {
            let name = segment_file_name(id);
            fs::copy(dir.join(&name), backup.join(&name)).unwrap();
        }
        compact_all(&store, &index);
    }

    // Crash after the rename but before the old inputs were deleted
    for id in 1..=5 {
        let name = segment_file_name(id);
        fs::copy(backup.join(&name), dir.join(&name)).unwrap();
    }

    let index = KeyIndex::new();
    let (store, result) =
        LogStore::open(&dir, options(), RecoveryPlan::default(), |l, e| index.apply(l, e)).unwrap();

    assert_eq!(result.segments_removed, 5);
    assert_eq!(store.segment_ids(), vec![6, 7]);
    for id in 1..=5 {
        assert!(!dir.join(segment_file_name(id)).exists());
    }
    assert_eq!(get(&store, &index, "key_3"), Some(b"round_2".to_vec()));
}

#[test]
fn test_compacting_everything_keeps_sequence_floor() {
    let (_temp, dir) = setup_temp_log();
    {
        let (store, index) = open_indexed(&dir);
        put(&store, &index, "a", "1");
        delete(&store, &index, "a");
        let stats = compact_all(&store, &index);
        assert_eq!(stats.entries_kept, 0);
    }

    let (store, index) = open_indexed(&dir);
    assert!(index.is_empty());
    assert_eq!(store.append(Operation::Delete { key: b"a".to_vec() }).unwrap().sequence, 3);
}

#[test]
fn test_relocation_skips_keys_overwritten_meanwhile() {
    let (_temp, dir) = setup_temp_log();
    let (store, index) = open_indexed(&dir);
    write_rounds(&store, &index);
    store.seal_active().unwrap();
    let durable = store.sync().unwrap();
    let plan = store
        .plan_compaction(durable.sequence, &index.live_bytes_by_segment())
        .unwrap()
        .unwrap();

    // A write lands between copying and swapping
    let stats = store
        .compact(
            &plan,
            |key, location| index.points_to(key, location),
            |moves| {
                put(&store, &index, "key_0", "newest");
                index.relocate_all(moves);
            },
        )
        .unwrap();

    assert_eq!(stats.entries_kept, 4);
    assert_eq!(get(&store, &index, "key_0"), Some(b"newest".to_vec()));
    assert_eq!(get(&store, &index, "key_1"), Some(b"round_2".to_vec()));
}
