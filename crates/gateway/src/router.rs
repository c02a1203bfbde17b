//! Response routing from worker mailboxes to waiting tasks.
//!
//! Each worker has a single response mailbox but may be serving chunks for
//! several in-flight tasks queued behind each other. One router thread per
//! worker index drains the mailbox and hands every chunk to the channel
//! registered for its task id. A task that is no longer registered (the
//! client canceled and the dispatcher stopped waiting) has its chunks
//! dropped here, which keeps the mailbox flowing so the worker never
//! stalls on the consumed signal.

use crossbeam::channel::{bounded, Receiver, Sender};
use spindle_ipc::{IpcEndpoint, ResponseChunk, MAX_WORKERS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Poll interval of the router threads; bounds shutdown latency.
const PUMP_TICK: Duration = Duration::from_millis(250);

/// Per-task channel capacity. A worker produces at most one chunk per
/// consumed signal, so a small buffer only smooths scheduling jitter.
const CHANNEL_CAPACITY: usize = 64;

/// How long a router thread waits on a full task channel before dropping
/// the chunk. Receivers are drained continuously, so this firing means the
/// receiving side is gone or wedged.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

struct RouterShared {
    ipc: Arc<IpcEndpoint>,
    stop: AtomicBool,
    pending: Vec<Mutex<HashMap<u64, Sender<ResponseChunk>>>>,
}

/// Demultiplexes worker response mailboxes onto per-task channels.
pub struct ResponseRouter {
    shared: Arc<RouterShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ResponseRouter {
    /// Start one router thread per worker index.
    pub fn start(ipc: Arc<IpcEndpoint>) -> Self {
        let shared = Arc::new(RouterShared {
            ipc,
            stop: AtomicBool::new(false),
            pending: (0..MAX_WORKERS).map(|_| Mutex::new(HashMap::new())).collect(),
        });

        let handles = (0..MAX_WORKERS)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("resp-router-{}", worker))
                    .spawn(move || pump_loop(shared, worker))
                    .expect("failed to spawn router thread")
            })
            .collect();

        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// Register interest in `task_id` on `worker` and get the channel its
    /// chunks will arrive on. Must happen before the request is published
    /// to the worker, or early chunks are lost.
    pub fn register(&self, worker: usize, task_id: u64) -> Receiver<ResponseChunk> {
        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let mut pending = self.shared.pending[worker].lock().unwrap();
        pending.insert(task_id, tx);
        rx
    }

    /// Drop the registration for `task_id`; later chunks are discarded.
    pub fn deregister(&self, worker: usize, task_id: u64) {
        let mut pending = self.shared.pending[worker].lock().unwrap();
        pending.remove(&task_id);
    }

    /// Stop all router threads and wait for them to exit.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ResponseRouter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop(shared: Arc<RouterShared>, worker: usize) {
    while !shared.stop.load(Ordering::SeqCst) {
        let chunk = match shared.ipc.recv_chunk(worker, PUMP_TICK) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => continue,
            Err(e) => {
                if !shared.stop.load(Ordering::SeqCst) {
                    warn!(worker, "response pump error: {}", e);
                    std::thread::sleep(Duration::from_millis(50));
                }
                continue;
            }
        };

        let sender = {
            let pending = shared.pending[worker].lock().unwrap();
            pending.get(&chunk.task_id).cloned()
        };

        match sender {
            Some(sender) => {
                let task_id = chunk.task_id;
                if sender.send_timeout(chunk, DELIVERY_TIMEOUT).is_err() {
                    debug!(worker, task_id, "receiver gone, dropping chunk");
                }
            }
            None => {
                debug!(worker, task_id = chunk.task_id, "dropping chunk for unregistered task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_common::IpcNames;

    fn test_endpoint(tag: &str) -> Arc<IpcEndpoint> {
        let names = IpcNames::scoped(&format!("rt_{}_{}", tag, std::process::id()));
        Arc::new(IpcEndpoint::server(&names).unwrap())
    }

    #[test]
    fn test_routes_interleaved_tasks_to_their_channels() {
        let ipc = test_endpoint("interleave");
        let router = ResponseRouter::start(Arc::clone(&ipc));

        let rx_a = router.register(0, 10);
        let rx_b = router.register(0, 11);

        // One worker alternating chunks between two in-flight tasks.
        ipc.send_chunk(0, 10, b"a1", false).unwrap();
        ipc.send_chunk(0, 11, b"b1", false).unwrap();
        ipc.send_chunk(0, 10, b"a2", true).unwrap();
        ipc.send_chunk(0, 11, b"b2", true).unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(rx_a.recv_timeout(timeout).unwrap().payload, b"a1");
        assert_eq!(rx_b.recv_timeout(timeout).unwrap().payload, b"b1");

        let last_a = rx_a.recv_timeout(timeout).unwrap();
        assert_eq!(last_a.payload, b"a2");
        assert!(last_a.is_last);

        let last_b = rx_b.recv_timeout(timeout).unwrap();
        assert_eq!(last_b.payload, b"b2");
        assert!(last_b.is_last);

        router.stop();
    }

    #[test]
    fn test_unregistered_chunks_are_dropped_without_stalling() {
        let ipc = test_endpoint("dropped");
        let router = ResponseRouter::start(Arc::clone(&ipc));

        // Nothing is registered for task 99; the mailbox must keep moving
        // anyway so later tasks are unaffected.
        for i in 0..4 {
            ipc.send_chunk(1, 99, b"orphan", i == 3).unwrap();
        }

        let rx = router.register(1, 100);
        ipc.send_chunk(1, 100, b"mine", true).unwrap();

        let chunk = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(chunk.payload, b"mine");
        assert!(chunk.is_last);

        router.stop();
    }

    #[test]
    fn test_deregister_discards_further_chunks() {
        let ipc = test_endpoint("dereg");
        let router = ResponseRouter::start(Arc::clone(&ipc));

        let rx = router.register(2, 7);
        ipc.send_chunk(2, 7, b"first", false).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().payload, b"first");

        router.deregister(2, 7);
        ipc.send_chunk(2, 7, b"late", true).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        router.stop();
    }
}
