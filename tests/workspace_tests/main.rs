//! Tests for the workspace: locking and the running config file
//!
//! These tests verify:
//! - Exclusive locking (within one process) and release on drop
//! - Workspace layout creation
//! - Running config round trip and atomic replacement
//! - Corruption detection (parse error, checksum, version)

use std::fs;
use std::path::{Path, PathBuf};

use falconkv::workspace::{
    Checkpoint, RunningConfig, Workspace, WorkspaceLock, LOCK_FILENAME, SEGMENTS_DIR,
};
use falconkv::KvError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_workspace() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let workspace = temp_dir.path().join("ws");
    (temp_dir, workspace)
}

fn sample_config(workspace: &Path) -> RunningConfig {
    RunningConfig::new(
        workspace,
        false,
        Checkpoint {
            segment_id: 3,
            offset: 1234,
            sequence: 42,
        },
    )
}

// =============================================================================
// Lock Tests
// =============================================================================

#[test]
fn test_lock_creates_workspace() {
    let (_temp, workspace) = setup_temp_workspace();
    assert!(!workspace.exists());

    let lock = WorkspaceLock::acquire(&workspace).unwrap();

    assert!(workspace.exists());
    assert_eq!(lock.path(), workspace.join(LOCK_FILENAME));
}

#[test]
fn test_double_lock_fails() {
    let (_temp, workspace) = setup_temp_workspace();
    let _lock = WorkspaceLock::acquire(&workspace).unwrap();

    let result = WorkspaceLock::acquire(&workspace);

    match result {
        Err(KvError::WorkspaceLocked(path)) => assert_eq!(path, workspace),
        other => panic!("expected WorkspaceLocked, got {:?}", other.err()),
    }
}

#[test]
fn test_lock_released_on_drop() {
    let (_temp, workspace) = setup_temp_workspace();
    {
        let _lock = WorkspaceLock::acquire(&workspace).unwrap();
    }

    WorkspaceLock::acquire(&workspace).unwrap();
}

#[test]
fn test_workspace_open_creates_layout() {
    let (_temp, workspace) = setup_temp_workspace();
    let running = workspace.join("meta").join("running.json");

    let ws = Workspace::open(&workspace, running.clone()).unwrap();

    assert!(workspace.join(LOCK_FILENAME).exists());
    assert!(workspace.join(SEGMENTS_DIR).is_dir());
    assert!(running.parent().unwrap().is_dir());
    assert_eq!(ws.segments_dir(), workspace.join(SEGMENTS_DIR));
    assert_eq!(ws.running_config_path(), running.as_path());
    assert!(matches!(
        Workspace::open(&workspace, running),
        Err(KvError::WorkspaceLocked(_))
    ));
}

// =============================================================================
// Running Config Tests
// =============================================================================

#[test]
fn test_load_missing_is_none() {
    let (_temp, workspace) = setup_temp_workspace();
    let path = workspace.join("running_config.json");

    assert_eq!(RunningConfig::load(&path).unwrap(), None);
}

#[test]
fn test_store_then_load() {
    let (_temp, workspace) = setup_temp_workspace();
    fs::create_dir_all(&workspace).unwrap();
    let path = workspace.join("running_config.json");
    let config = sample_config(&workspace);

    config.store(&path).unwrap();

    assert_eq!(RunningConfig::load(&path).unwrap(), Some(config));
    // No temp file left behind
    assert!(!workspace.join("running_config.json.tmp").exists());
}

#[test]
fn test_store_replaces_previous() {
    let (_temp, workspace) = setup_temp_workspace();
    fs::create_dir_all(&workspace).unwrap();
    let path = workspace.join("running_config.json");
    sample_config(&workspace).store(&path).unwrap();

    let mut newer = sample_config(&workspace);
    newer.clean_shutdown = true;
    newer.checkpoint.sequence = 50;
    newer.store(&path).unwrap();

    let loaded = RunningConfig::load(&path).unwrap().unwrap();
    assert!(loaded.clean_shutdown);
    assert_eq!(loaded.checkpoint.sequence, 50);
}

#[test]
fn test_load_rejects_garbage() {
    let (_temp, workspace) = setup_temp_workspace();
    fs::create_dir_all(&workspace).unwrap();
    let path = workspace.join("running_config.json");
    fs::write(&path, b"{ not json").unwrap();

    assert!(matches!(
        RunningConfig::load(&path),
        Err(KvError::ConfigCorrupt(_))
    ));
}

#[test]
fn test_load_rejects_checksum_mismatch() {
    let (_temp, workspace) = setup_temp_workspace();
    fs::create_dir_all(&workspace).unwrap();
    let path = workspace.join("running_config.json");
    sample_config(&workspace).store(&path).unwrap();

    // Still valid JSON, but the content no longer matches the checksum
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"sequence\": 42"));
    fs::write(&path, text.replace("\"sequence\": 42", "\"sequence\": 43")).unwrap();

    match RunningConfig::load(&path) {
        Err(KvError::ConfigCorrupt(reason)) => assert!(reason.contains("checksum")),
        other => panic!("expected ConfigCorrupt, got {:?}", other),
    }
}

#[test]
fn test_load_rejects_unknown_version() {
    let (_temp, workspace) = setup_temp_workspace();
    fs::create_dir_all(&workspace).unwrap();
    let path = workspace.join("running_config.json");
    sample_config(&workspace).store(&path).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"format_version\": 1"));
    fs::write(&path, text.replace("\"format_version\": 1", "\"format_version\": 2")).unwrap();

    match RunningConfig::load(&path) {
        Err(KvError::ConfigCorrupt(reason)) => assert!(reason.contains("version")),
        other => panic!("expected ConfigCorrupt, got {:?}", other),
    }
}

#[test]
fn test_workspace_running_config_passthrough() {
    let (_temp, workspace) = setup_temp_workspace();
    let ws = Workspace::open(&workspace, workspace.join("rc.json")).unwrap();
    assert_eq!(ws.load_running_config().unwrap(), None);

    let config = sample_config(&workspace);
    ws.store_running_config(&config).unwrap();

    assert_eq!(ws.load_running_config().unwrap(), Some(config));
}
