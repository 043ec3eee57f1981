//! Engine Module
//!
//! The key-value facade that coordinates the workspace, the log and the index.
//!
//! ## Responsibilities
//! - Workspace lifecycle: lock, running config, clean/unclean shutdown
//! - Crash recovery on startup (log replay into the index)
//! - Put/Get/Delete with a single-writer discipline
//! - Checkpoints and compaction (explicit or via the maintenance worker)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigCorruptPolicy};
use crate::error::{KvError, Result};
use crate::index::{IndexEntry, KeyIndex};
use crate::log::{
    CompactionPlan, CompactionStats, LogIterator, LogOptions, LogStore, Operation, RecoveryPlan,
    RecoveryResult,
};
use crate::maintenance::MaintenanceWorker;
use crate::workspace::{Checkpoint, RunningConfig, Workspace};

/// The point operations every FalconKV store offers
pub trait KvStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Current value of `key`; `None` if absent
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Remove `key`; `false` if it was absent
    fn delete(&self, key: &[u8]) -> Result<bool>;
}

/// How the previous engine left the workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// No running config: first start
    Fresh,

    /// Previous engine shut down cleanly
    Clean,

    /// Previous engine died; the checkpoint bounded what had to survive
    Unclean,

    /// Running config was corrupt and ignored; full replay without a checkpoint
    ConfigFallback,
}

/// What `Engine::open` found and did
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryReport {
    pub mode: RecoveryMode,

    /// Why the running config was rejected (only for `ConfigFallback`)
    pub config_error: Option<String>,

    /// Checkpoint taken from the running config, if one was trusted
    pub checkpoint: Option<Checkpoint>,

    pub log: RecoveryResult,

    /// Live keys after replay
    pub keys_loaded: usize,
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub keys: usize,
    pub segments: usize,
    pub active_segment: u64,
    pub log_bytes: u64,
    pub next_sequence: u64,
    pub checkpoint_sequence: u64,
}

/// State shared between the engine handle and the maintenance worker
pub(crate) struct Shared {
    config: Config,
    workspace: Workspace,
    log: LogStore,
    index: KeyIndex,

    /// Serializes mutations (put/delete) across append + index update
    write_lock: Mutex<()>,

    /// Serializes checkpoints so running-config writes never go backwards
    checkpoint: Mutex<Checkpoint>,

    /// One compaction at a time
    compaction_lock: Mutex<()>,
}

/// The main key-value engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (put/delete): serialized by `write_lock`, held across
///   "append to log → update index", so same-key operations take effect in
///   sequence-number order
///
/// - **Reads** (get): no writer lock
///   - Pin the segment table (shared), look up the index (shared), `pread`
///   - The pin keeps compaction from swapping a segment between lookup and read
///
/// - **Lock order**: compaction → write_lock → checkpoint → log writer →
///   segment table → index
///
/// `Engine` is `Send + Sync`; share it with `Arc<Engine>`.
pub struct Engine {
    shared: Arc<Shared>,
    report: RecoveryReport,
    maintenance: Option<MaintenanceWorker>,
}

impl Engine {
    /// Open or create the engine for `workspace`, using `running_config` as
    /// the running-config file
    pub fn init(workspace: impl Into<PathBuf>, running_config: impl Into<PathBuf>) -> Result<Self> {
        let config = Config::builder()
            .workspace(workspace)
            .running_config_path(running_config)
            .build();
        Self::open(config)
    }

    /// Open with a workspace path and otherwise default config
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().workspace(path).build())
    }

    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Lock the workspace (fails fast with `WorkspaceLocked`)
    /// 2. Load the running config and decide what the log must still contain
    /// 3. Recover the log, replaying it into the index
    /// 4. Mark the workspace live (`clean_shutdown = false`)
    /// 5. Start the maintenance worker if configured
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Step 1: Lock
        let workspace = Workspace::open(&config.workspace, config.running_config_path())?;

        // Step 2: Running config
        let (mode, config_error, checkpoint) = match workspace.load_running_config() {
            Ok(None) => (RecoveryMode::Fresh, None, None),
            Ok(Some(running)) => {
                if running.workspace != config.workspace {
                    warn!(
                        recorded = %running.workspace.display(),
                        actual = %config.workspace.display(),
                        "Running config was written for a different workspace path"
                    );
                }
                let mode = if running.clean_shutdown {
                    RecoveryMode::Clean
                } else {
                    RecoveryMode::Unclean
                };
                (mode, None, Some(running.checkpoint))
            }
            Err(KvError::ConfigCorrupt(reason)) => match config.on_config_corrupt {
                ConfigCorruptPolicy::Fail => return Err(KvError::ConfigCorrupt(reason)),
                ConfigCorruptPolicy::Replay => {
                    warn!(%reason, "Running config corrupt, replaying the full log");
                    (RecoveryMode::ConfigFallback, Some(reason), None)
                }
            },
            Err(e) => return Err(e),
        };

        // Step 3: Recover the log into a fresh index
        let plan = RecoveryPlan {
            durable_sequence: checkpoint.map(|c| c.sequence).filter(|&s| s > 0),
        };
        let options = LogOptions {
            sync_strategy: config.sync_strategy,
            segment_size_limit: config.segment_size_limit,
            min_next_sequence: checkpoint.map(|c| c.sequence + 1).unwrap_or(1),
        };
        let index = KeyIndex::new();
        let (log, log_result) = LogStore::open(&workspace.segments_dir(), options, plan, |location, entry| {
            index.apply(location, entry)
        })?;

        // Step 4: Mark live
        let durable = Checkpoint::from(log.sync()?);
        workspace.store_running_config(&RunningConfig::new(&config.workspace, false, durable))?;

        let report = RecoveryReport {
            mode,
            config_error,
            checkpoint,
            log: log_result,
            keys_loaded: index.len(),
        };
        info!(
            workspace = %config.workspace.display(),
            mode = ?report.mode,
            keys = report.keys_loaded,
            entries_recovered = report.log.entries_recovered,
            was_truncated = report.log.was_truncated,
            "Engine opened"
        );

        let maintenance_interval = config.maintenance_interval;
        let shared = Arc::new(Shared {
            config,
            workspace,
            log,
            index,
            write_lock: Mutex::new(()),
            checkpoint: Mutex::new(durable),
            compaction_lock: Mutex::new(()),
        });

        // Step 5: Background maintenance
        let maintenance = match maintenance_interval {
            Some(interval) => Some(MaintenanceWorker::spawn(Arc::clone(&shared), interval)?),
            None => None,
        };

        Ok(Self {
            shared,
            report,
            maintenance,
        })
    }

    /// Store `value` under `key`
    ///
    /// Steps:
    /// 1. Validate the key and value
    /// 2. Acquire write lock
    /// 3. Append to the log (durable per sync strategy)
    /// 4. Point the index at the new entry
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared.validate_key(key)?;
        if value.len() > self.shared.config.max_value_size {
            return Err(KvError::InvalidArgument(format!(
                "value of {} bytes exceeds limit of {}",
                value.len(),
                self.shared.config.max_value_size
            )));
        }

        let _write_guard = self.shared.write_lock.lock();
        let appended = self.shared.log.append(Operation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.shared.index.upsert(
            key.to_vec(),
            IndexEntry {
                sequence: appended.sequence,
                location: appended.location,
                value_len: value.len(),
            },
        );
        Ok(())
    }

    /// Current value of `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.validate_key(key)?;
        self.shared.get(key)
    }

    /// Remove `key`
    ///
    /// An absent key returns `false` without writing anything.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.shared.validate_key(key)?;

        let _write_guard = self.shared.write_lock.lock();
        if self.shared.index.lookup(key).is_none() {
            return Ok(false);
        }
        self.shared.log.append(Operation::Delete { key: key.to_vec() })?;
        self.shared.index.remove(key);
        Ok(true)
    }

    /// Length of the value stored under `key`, without reading it
    pub fn value_len(&self, key: &[u8]) -> Result<Option<usize>> {
        self.shared.validate_key(key)?;
        Ok(self.shared.index.lookup(key).map(|e| e.value_len))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.shared.validate_key(key)?;
        Ok(self.shared.index.lookup(key).is_some())
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.shared.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.index.is_empty()
    }

    /// Sync the log and persist its tail as the new checkpoint
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.shared.checkpoint()
    }

    /// Checkpoint and compact every segment, the active one included
    ///
    /// The active segment is sealed only if that lets compaction reclaim
    /// garbage or merge segments; otherwise nothing on disk changes.
    pub fn compact(&self) -> Result<CompactionStats> {
        self.shared.compact_all()
    }

    /// Lazy iterator over log entries with `sequence >= start`
    pub fn read_from(&self, start: u64) -> Result<LogIterator> {
        self.shared.log.read_from(start)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            keys: self.shared.index.len(),
            segments: self.shared.log.segment_count(),
            active_segment: self.shared.log.active_segment_id(),
            log_bytes: self.shared.log.total_bytes()?,
            next_sequence: self.shared.log.next_sequence(),
            checkpoint_sequence: self.shared.checkpoint.lock().sequence,
        })
    }

    /// What startup recovery found
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Close the engine gracefully
    ///
    /// Stops maintenance, syncs the log, records a clean shutdown with the
    /// log tail as checkpoint, then releases the workspace lock.
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(worker) = self.maintenance.take() {
            worker.stop();
        }

        let _write_guard = self.shared.write_lock.lock();
        let mut last = self.shared.checkpoint.lock();
        let tail = Checkpoint::from(self.shared.log.sync()?);
        let running = RunningConfig::new(&self.shared.config.workspace, true, tail);
        self.shared.workspace.store_running_config(&running)?;
        *last = tail;

        info!(
            workspace = %self.shared.config.workspace.display(),
            sequence = tail.sequence,
            "Engine shut down cleanly"
        );
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn workspace(&self) -> &Path {
        &self.shared.config.workspace
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.shared.workspace.segments_dir()
    }

    pub fn running_config_path(&self) -> &Path {
        self.shared.workspace.running_config_path()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl KvStore for Engine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Engine::put(self, key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Engine::get(self, key)
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        Engine::delete(self, key)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Without shutdown() the workspace stays marked unclean
        if let Some(worker) = self.maintenance.take() {
            worker.stop();
        }
        debug!(workspace = %self.shared.config.workspace.display(), "Engine dropped");
    }
}

impl Shared {
    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(KvError::InvalidArgument("key must not be empty".into()));
        }
        if key.len() > self.config.max_key_size {
            return Err(KvError::InvalidArgument(format!(
                "key of {} bytes exceeds limit of {}",
                key.len(),
                self.config.max_key_size
            )));
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // Pin before the lookup so the location stays readable
        let segments = self.log.pin();
        let entry = match self.index.lookup(key) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let logged = segments.read_entry(&entry.location)?;
        match logged.operation {
            Operation::Put { key: stored, value } if stored == key => Ok(Some(value)),
            _ => Err(KvError::Corruption(format!(
                "index entry for sequence {} does not hold a put of the requested key",
                entry.sequence
            ))),
        }
    }

    pub(crate) fn checkpoint(&self) -> Result<Checkpoint> {
        let mut last = self.checkpoint.lock();
        let tail = Checkpoint::from(self.log.sync()?);
        if tail != *last {
            let running = RunningConfig::new(&self.config.workspace, false, tail);
            self.workspace.store_running_config(&running)?;
            *last = tail;
            debug!(sequence = tail.sequence, segment_id = tail.segment_id, "Checkpoint written");
        }
        Ok(tail)
    }

    /// Checkpoint, then compact the eligible run if its garbage ratio reaches
    /// `min_garbage_ratio`
    pub(crate) fn compact(&self, min_garbage_ratio: f64) -> Result<CompactionStats> {
        let _compaction_guard = self.compaction_lock.lock();
        // Every entry up to a checkpoint taken under write_lock is indexed
        let plan = {
            let _write_guard = self.write_lock.lock();
            let checkpoint = self.checkpoint()?;
            self.log
                .plan_compaction(checkpoint.sequence, &self.index.live_bytes_by_segment())?
        };
        let plan = match plan {
            Some(plan) if plan.is_worthwhile() => plan,
            _ => return Ok(CompactionStats::default()),
        };
        if plan.garbage_ratio() < min_garbage_ratio {
            debug!(
                garbage_ratio = plan.garbage_ratio(),
                threshold = min_garbage_ratio,
                "Skipping compaction"
            );
            return Ok(CompactionStats::default());
        }
        self.run_plan(&plan)
    }

    /// Seal the active segment if that makes compaction worthwhile, then
    /// compact everything eligible
    pub(crate) fn compact_all(&self) -> Result<CompactionStats> {
        let _compaction_guard = self.compaction_lock.lock();
        let plan = {
            let _write_guard = self.write_lock.lock();
            let checkpoint = self.checkpoint()?;
            let live = self.index.live_bytes_by_segment();
            match self.log.plan_compaction_with_active(checkpoint.sequence, &live)? {
                Some(plan) if plan.is_worthwhile() => {}
                _ => return Ok(CompactionStats::default()),
            }
            // No appends while write_lock is held, so the checkpoint still
            // covers everything the sealed segment holds
            self.log.seal_active()?;
            self.log.plan_compaction(checkpoint.sequence, &live)?
        };
        match plan {
            Some(plan) if plan.is_worthwhile() => self.run_plan(&plan),
            _ => Ok(CompactionStats::default()),
        }
    }

    fn run_plan(&self, plan: &CompactionPlan) -> Result<CompactionStats> {
        self.log.compact(
            plan,
            |key, location| self.index.points_to(key, location),
            |moves| {
                self.index.relocate_all(moves);
            },
        )
    }

    pub(crate) fn compaction_garbage_ratio(&self) -> f64 {
        self.config.compaction_garbage_ratio
    }
}
