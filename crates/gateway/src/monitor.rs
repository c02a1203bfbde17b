//! Background pool monitor.
//!
//! One long-lived thread drives the manager's scaling and health checks on
//! a fixed cadence and keeps the pool gauges fresh. Stops cooperatively:
//! the shutdown path sends on the stop channel and joins.

use crate::manager::{WorkerManager, SCALE_CHECK_INTERVAL};
use spindle_common::METRICS;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Handle to the monitor thread.
pub struct Monitor {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Start the monitor loop.
    pub fn start(manager: Arc<WorkerManager>) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("pool-monitor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(SCALE_CHECK_INTERVAL) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                manager.check_and_scale();
                manager.restart_unhealthy_workers();

                METRICS.pool.workers_deployed.set(manager.deployed_count() as i64);
                METRICS.pool.workers_busy.set(manager.busy_count() as i64);

                debug!(
                    deployed = manager.deployed_count(),
                    busy = manager.busy_count(),
                    pending = manager.pending_count(),
                    processed = manager.total_processed(),
                    "pool status"
                );
                for stat in manager.stats() {
                    trace!(
                        index = stat.index,
                        pid = stat.pid,
                        busy = stat.busy,
                        tasks = stat.tasks_processed,
                        "worker"
                    );
                }
            })
            .expect("failed to spawn monitor thread");

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the loop and wait for the thread to exit.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
