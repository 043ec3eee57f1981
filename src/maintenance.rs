//! Background maintenance
//!
//! A single thread that periodically checkpoints the engine and compacts
//! sealed segments once enough of them is garbage.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Sender};
use tracing::{debug, error, info};

use crate::engine::Shared;
use crate::error::Result;

pub(crate) struct MaintenanceWorker {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub(crate) fn spawn(shared: Arc<Shared>, interval: Duration) -> Result<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("falconkv-maintenance".into())
            .spawn(move || {
                debug!(?interval, "Maintenance worker started");
                loop {
                    crossbeam::select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => run_once(&shared),
                    }
                }
                debug!("Maintenance worker stopped");
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the worker and wait for it to finish its current pass
    pub(crate) fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            // A full channel means a stop is already pending
            let _ = self.shutdown.try_send(());
            if handle.join().is_err() {
                error!("Maintenance worker panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.join();
    }
}

/// One checkpoint + conditional compaction pass; failures are logged and
/// retried on the next tick
fn run_once(shared: &Shared) {
    match shared.compact(shared.compaction_garbage_ratio()) {
        Ok(stats) if stats.segments_compacted > 0 => info!(
            segments = stats.segments_compacted,
            dropped = stats.entries_dropped,
            bytes_reclaimed = stats.bytes_before.saturating_sub(stats.bytes_after),
            "Background compaction finished"
        ),
        Ok(_) => {}
        Err(e) => error!(error = %e, "Background maintenance failed"),
    }
}
