//! Worker process pool management.
//!
//! The manager owns a fixed table of worker slots. It spawns worker
//! processes, tracks liveness and load, hands out workers for new tasks,
//! scales the pool up on demand and down when idle, and replaces workers
//! that fail a health check.
//!
//! Locking discipline: the slot table sits behind one mutex, taken briefly
//! by assignment, the lifecycle hooks and the monitor thread. The pending
//! and processed counters are plain atomics so the hot path never touches
//! the lock twice.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use spindle_common::{GatewayConfig, Result, SpindleError, METRICS};
use spindle_ipc::{IpcEndpoint, MAX_WORKERS};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the monitor drives scaling and health checks.
pub const SCALE_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Idle time after which a surplus worker becomes a scale-down candidate.
pub const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Scale down only while fewer than this many requests are pending.
pub const SCALE_DOWN_THRESHOLD: usize = 2;

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(200);

/// How long to wait for a spawned worker to attach to the shared region.
const READY_TIMEOUT: Duration = Duration::from_millis(500);
const READY_POLL: Duration = Duration::from_millis(5);

struct WorkerSlot {
    pid: Pid,
    child: Child,
    busy: bool,
    last_activity: Instant,
    tasks_processed: u64,
}

/// Point-in-time view of one worker, for logs and the monitor summary.
#[derive(Debug, Clone)]
pub struct WorkerStat {
    pub index: usize,
    pub pid: i32,
    pub busy: bool,
    pub tasks_processed: u64,
}

/// Spawns, assigns, scales and reaps worker processes.
pub struct WorkerManager {
    ipc: Arc<IpcEndpoint>,
    executable: PathBuf,
    min_workers: usize,
    max_workers: usize,
    child_env: Vec<(&'static str, String)>,
    slots: Mutex<Vec<Option<WorkerSlot>>>,
    deployed: AtomicUsize,
    pending: AtomicUsize,
    total_processed: AtomicU64,
    rr_counter: AtomicUsize,
    idle_timeout: Duration,
}

impl WorkerManager {
    pub fn new(ipc: Arc<IpcEndpoint>, config: &GatewayConfig) -> Self {
        let max_workers = config.max_workers.min(MAX_WORKERS).max(config.min_workers);
        info!(
            min = config.min_workers,
            max = max_workers,
            executable = %config.worker_executable_path.display(),
            "worker manager configured"
        );

        Self {
            ipc,
            executable: config.worker_executable_path.clone(),
            min_workers: config.min_workers,
            max_workers,
            child_env: config.ipc.env_overrides(),
            slots: Mutex::new((0..MAX_WORKERS).map(|_| None).collect()),
            deployed: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            total_processed: AtomicU64::new(0),
            rr_counter: AtomicUsize::new(0),
            idle_timeout: WORKER_IDLE_TIMEOUT,
        }
    }

    /// Spawn the initial pool of `min_workers` workers.
    pub fn initialize(&self) -> Result<()> {
        if !self.executable.exists() {
            return Err(SpindleError::config(format!(
                "worker executable not found: {}",
                self.executable.display()
            )));
        }

        for index in 0..self.min_workers {
            self.spawn_worker(index)?;
        }

        info!(deployed = self.deployed_count(), "initial workers started");
        Ok(())
    }

    /// Spawn a worker into slot `index`. A live worker already in the slot
    /// is left alone.
    pub fn spawn_worker(&self, index: usize) -> Result<()> {
        if index >= MAX_WORKERS {
            return Err(SpindleError::internal(format!(
                "worker index {} out of range",
                index
            )));
        }

        let already_running = {
            let mut slots = self.slots.lock().unwrap();
            match slots[index].as_mut() {
                Some(slot) => matches!(slot.child.try_wait(), Ok(None)),
                None => false,
            }
        };
        if already_running {
            debug!(index, "worker already deployed");
            return Ok(());
        }
        // Reap a dead occupant, if any, so the deployed count stays honest.
        self.terminate_worker(index);

        self.ipc.clear_worker_attached(index);

        let mut command = Command::new(&self.executable);
        command
            .arg(format!("--index={}", index))
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in &self.child_env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|e| {
            SpindleError::config(format!(
                "failed to spawn worker {}: {}",
                self.executable.display(),
                e
            ))
        })?;
        let pid = Pid::from_raw(child.id() as i32);

        {
            let mut slots = self.slots.lock().unwrap();
            slots[index] = Some(WorkerSlot {
                pid,
                child,
                busy: false,
                last_activity: Instant::now(),
                tasks_processed: 0,
            });
        }
        self.deployed.fetch_add(1, Ordering::SeqCst);
        METRICS.pool.workers_deployed.set(self.deployed_count() as i64);

        debug!(index, pid = pid.as_raw(), "worker spawned");
        self.wait_for_attach(index);
        Ok(())
    }

    /// Poll the shared region's attach flag instead of sleeping blind.
    fn wait_for_attach(&self, index: usize) {
        let deadline = Instant::now() + READY_TIMEOUT;
        while Instant::now() < deadline {
            if self.ipc.worker_attached(index) {
                debug!(index, "worker attached");
                return;
            }
            std::thread::sleep(READY_POLL);
        }
        warn!(index, "worker did not attach within the ready window");
    }

    /// Terminate the worker in slot `index`: SIGTERM, a short grace period,
    /// then SIGKILL. Returns false if the slot was empty.
    pub fn terminate_worker(&self, index: usize) -> bool {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            slots[index].take()
        };
        let Some(mut slot) = slot else {
            return false;
        };

        debug!(index, pid = slot.pid.as_raw(), "terminating worker");
        let _ = kill(slot.pid, Signal::SIGTERM);

        if !matches!(slot.child.try_wait(), Ok(Some(_))) {
            std::thread::sleep(TERM_GRACE);
            if !matches!(slot.child.try_wait(), Ok(Some(_))) {
                let _ = kill(slot.pid, Signal::SIGKILL);
                let _ = slot.child.wait();
            }
        }

        self.deployed.fetch_sub(1, Ordering::SeqCst);
        METRICS.pool.workers_deployed.set(self.deployed_count() as i64);
        true
    }

    /// Pick a worker for a new task.
    ///
    /// Round-robin over idle deployed workers first; scale up into a free
    /// slot if all are busy; otherwise fall back to the deployed worker
    /// with the shallowest request queue.
    pub fn assign(&self) -> Option<usize> {
        let start = self.rr_counter.fetch_add(1, Ordering::Relaxed);
        {
            let slots = self.slots.lock().unwrap();
            for offset in 0..MAX_WORKERS {
                let index = (start + offset) % MAX_WORKERS;
                if let Some(slot) = &slots[index] {
                    if !slot.busy {
                        return Some(index);
                    }
                }
            }
        }

        if self.deployed_count() < self.max_workers {
            let free = {
                let slots = self.slots.lock().unwrap();
                (0..MAX_WORKERS).find(|i| slots[*i].is_none())
            };
            if let Some(index) = free {
                debug!(index, "scaling up on demand");
                match self.spawn_worker(index) {
                    Ok(()) => return Some(index),
                    Err(e) => warn!(index, "on-demand spawn failed: {}", e),
                }
            }
        }

        self.least_loaded_worker()
    }

    fn least_loaded_worker(&self) -> Option<usize> {
        let deployed: Vec<usize> = {
            let slots = self.slots.lock().unwrap();
            (0..MAX_WORKERS).filter(|i| slots[*i].is_some()).collect()
        };

        let mut best = None;
        let mut best_depth = usize::MAX;
        for index in deployed {
            let depth = self.ipc.queue_depth(index).unwrap_or(usize::MAX);
            if depth < best_depth {
                best_depth = depth;
                best = Some(index);
            }
        }
        best
    }

    /// Mark a worker busy at the start of a request.
    pub fn on_request_start(&self, index: usize) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots[index].as_mut() {
            slot.busy = true;
            slot.last_activity = Instant::now();
        }
        drop(slots);
        METRICS.pool.workers_busy.set(self.busy_count() as i64);
    }

    /// Mark a worker idle again once its request has fully completed.
    pub fn on_request_complete(&self, index: usize) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.total_processed.fetch_add(1, Ordering::SeqCst);
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots[index].as_mut() {
            slot.busy = false;
            slot.tasks_processed += 1;
            slot.last_activity = Instant::now();
        }
        drop(slots);
        METRICS.pool.workers_busy.set(self.busy_count() as i64);
        METRICS.pool.tasks_processed_total.inc();
    }

    /// Scale the pool down when demand is low.
    ///
    /// Picks the highest-indexed idle worker that has been idle past the
    /// timeout; never drops below `min_workers`, and always keeps at most
    /// one surplus idle worker around.
    pub fn check_and_scale(&self) {
        if self.pending_count() >= SCALE_DOWN_THRESHOLD {
            return;
        }
        if self.idle_count() <= 1 || self.deployed_count() <= self.min_workers {
            return;
        }

        let candidate = {
            let slots = self.slots.lock().unwrap();
            (0..MAX_WORKERS).rev().find(|i| {
                slots[*i]
                    .as_ref()
                    .map(|s| !s.busy && s.last_activity.elapsed() > self.idle_timeout)
                    .unwrap_or(false)
            })
        };

        if let Some(index) = candidate {
            info!(index, "scaling down idle worker");
            self.terminate_worker(index);
        }
    }

    /// Probe a worker for liveness.
    ///
    /// Workers are direct children, so a killed one lingers as a zombie
    /// that still answers `kill(pid, 0)`. `try_wait` reaps it and reports
    /// the exit; the signal probe remains as a fallback.
    pub fn is_worker_alive(&self, index: usize) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots[index].as_mut() {
            Some(slot) => match slot.child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(_) => kill(slot.pid, None).is_ok(),
            },
            None => false,
        }
    }

    /// Reap workers that fail the liveness probe and respawn them while the
    /// pool would otherwise sit below `min_workers`.
    pub fn restart_unhealthy_workers(&self) {
        for index in 0..MAX_WORKERS {
            let occupied = {
                let slots = self.slots.lock().unwrap();
                slots[index].is_some()
            };
            if !occupied || self.is_worker_alive(index) {
                continue;
            }

            warn!(index, "worker failed health check, reaping");
            self.terminate_worker(index);
            METRICS.pool.worker_restarts_total.inc();

            if self.deployed_count() < self.min_workers {
                if let Err(e) = self.spawn_worker(index) {
                    warn!(index, "failed to respawn worker: {}", e);
                }
            }
        }
    }

    /// Terminate every worker: SIGTERM round, short grace, SIGKILL round.
    pub fn shutdown(&self) {
        info!("terminating worker pool");
        let taken: Vec<(usize, WorkerSlot)> = {
            let mut slots = self.slots.lock().unwrap();
            (0..MAX_WORKERS)
                .filter_map(|i| slots[i].take().map(|s| (i, s)))
                .collect()
        };

        for (_, slot) in &taken {
            let _ = kill(slot.pid, Signal::SIGTERM);
        }
        std::thread::sleep(TERM_GRACE);

        for (index, mut slot) in taken {
            if !matches!(slot.child.try_wait(), Ok(Some(_))) {
                let _ = kill(slot.pid, Signal::SIGKILL);
                let _ = slot.child.wait();
            }
            debug!(index, "worker terminated");
        }

        self.deployed.store(0, Ordering::SeqCst);
        METRICS.pool.workers_deployed.set(0);
        METRICS.pool.workers_busy.set(0);
    }

    pub fn deployed_count(&self) -> usize {
        self.deployed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::SeqCst)
    }

    pub fn busy_count(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.iter().flatten().filter(|s| s.busy).count()
    }

    pub fn idle_count(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.iter().flatten().filter(|s| !s.busy).count()
    }

    /// PID of the worker in `index`, if deployed.
    pub fn worker_pid(&self, index: usize) -> Option<i32> {
        let slots = self.slots.lock().unwrap();
        slots[index].as_ref().map(|s| s.pid.as_raw())
    }

    /// Snapshot of all deployed workers.
    pub fn stats(&self) -> Vec<WorkerStat> {
        let slots = self.slots.lock().unwrap();
        (0..MAX_WORKERS)
            .filter_map(|index| {
                slots[index].as_ref().map(|slot| WorkerStat {
                    index,
                    pid: slot.pid.as_raw(),
                    busy: slot.busy,
                    tasks_processed: slot.tasks_processed,
                })
            })
            .collect()
    }

    #[cfg(test)]
    fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        if self.deployed_count() > 0 {
            self.shutdown();
        }
    }
}
