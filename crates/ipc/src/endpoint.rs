//! Role-tagged IPC endpoint.
//!
//! One endpoint per process owns the mapped shared region plus the four
//! named semaphores of every worker index:
//!
//! | semaphore          | initial  | posted by             | waited by |
//! |--------------------|----------|-----------------------|-----------|
//! | `req_items[w]`     | 0        | gateway (and shutdown)| worker w  |
//! | `req_space[w]`     | ring cap | worker w when done    | gateway   |
//! | `resp[w]`          | 0        | worker w per chunk    | gateway   |
//! | `resp_consumed[w]` | 1        | gateway per chunk     | worker w  |
//!
//! The server role unlinks any stale kernel objects left by a crashed run,
//! creates everything afresh and initializes the region; the worker role
//! opens the existing objects and verifies the region magic. Both roles use
//! the same operations, constrained only by the protocol.

use crate::layout::{
    RequestSlot, ResponseSlot, SharedRegion, MAX_PAYLOAD, MAX_WORKERS, RING_CAP_PER_WORKER,
};
use crate::sem::NamedSemaphore;
use crate::shm::SharedMemory;
use spindle_common::{IpcNames, Result, SpindleError};
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Which side of the fabric this endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The gateway: creates and owns all kernel objects.
    Server,
    /// A worker process: opens existing objects.
    Worker { index: usize },
}

/// A request copied out of a ring slot.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: u64,
    pub canceled: bool,
    pub payload: Vec<u8>,
}

/// A response chunk copied out of a worker's mailbox.
#[derive(Debug, Clone)]
pub struct ResponseChunk {
    pub task_id: u64,
    pub payload: Vec<u8>,
    pub is_last: bool,
}

/// Result of a best-effort cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The flag was planted before the worker dequeued the slot; the worker
    /// will skip the task and no chunks will be produced for it.
    Canceled,
    /// The task was not found between `tail` and `head`; it either finished,
    /// was already claimed by the worker, or never existed.
    NotFound,
}

struct WorkerSems {
    req_items: NamedSemaphore,
    req_space: NamedSemaphore,
    resp: NamedSemaphore,
    resp_consumed: NamedSemaphore,
}

/// Endpoint over the shared region and its semaphores.
pub struct IpcEndpoint {
    role: Role,
    shm: SharedMemory,
    sems: Vec<WorkerSems>,
    /// Serializes gateway-side writers of a ring's `head` (and `cancel`
    /// scans) so the single-writer discipline holds with concurrent
    /// dispatcher threads. Unused by the worker role.
    enqueue_locks: Vec<Mutex<()>>,
}

impl IpcEndpoint {
    /// Create the server endpoint: clean up stale names, create the region
    /// and semaphores, initialize the region.
    pub fn server(names: &IpcNames) -> Result<Self> {
        Self::cleanup_stale(names);

        let shm = SharedMemory::create(&names.shm_name, SharedRegion::size())?;
        unsafe { SharedRegion::initialize_in_place(shm.as_ptr() as *mut SharedRegion) };

        let mut sems = Vec::with_capacity(MAX_WORKERS);
        for i in 0..MAX_WORKERS {
            sems.push(WorkerSems {
                req_items: NamedSemaphore::create(&names.req_items(i), 0)?,
                req_space: NamedSemaphore::create(&names.req_space(i), RING_CAP_PER_WORKER as u32)?,
                resp: NamedSemaphore::create(&names.resp(i), 0)?,
                resp_consumed: NamedSemaphore::create(&names.resp_consumed(i), 1)?,
            });
        }

        debug!(shm = %names.shm_name, "server IPC endpoint initialized");

        Ok(Self {
            role: Role::Server,
            shm,
            sems,
            enqueue_locks: (0..MAX_WORKERS).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Open the worker endpoint for `index` and mark the slot attached.
    pub fn worker(names: &IpcNames, index: usize) -> Result<Self> {
        if index >= MAX_WORKERS {
            return Err(SpindleError::ipc(format!(
                "worker index {} out of range (max {})",
                index, MAX_WORKERS
            )));
        }

        let shm = SharedMemory::open(&names.shm_name, SharedRegion::size())?;
        let region = unsafe { &*(shm.as_ptr() as *const SharedRegion) };
        if !region.is_initialized() {
            return Err(SpindleError::ipc(format!(
                "shared region {} is not initialized by a gateway",
                names.shm_name
            )));
        }

        let mut sems = Vec::with_capacity(MAX_WORKERS);
        for i in 0..MAX_WORKERS {
            sems.push(WorkerSems {
                req_items: NamedSemaphore::open(&names.req_items(i))?,
                req_space: NamedSemaphore::open(&names.req_space(i))?,
                resp: NamedSemaphore::open(&names.resp(i))?,
                resp_consumed: NamedSemaphore::open(&names.resp_consumed(i))?,
            });
        }

        region.worker_attached[index].store(true, Ordering::Release);
        debug!(index, "worker IPC endpoint attached");

        Ok(Self {
            role: Role::Worker { index },
            shm,
            sems,
            enqueue_locks: (0..MAX_WORKERS).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Unlink every kernel object name a previous run may have left behind.
    pub fn cleanup_stale(names: &IpcNames) {
        SharedMemory::unlink_stale(&names.shm_name);
        for i in 0..MAX_WORKERS {
            NamedSemaphore::unlink_stale(&names.req_items(i));
            NamedSemaphore::unlink_stale(&names.req_space(i));
            NamedSemaphore::unlink_stale(&names.resp(i));
            NamedSemaphore::unlink_stale(&names.resp_consumed(i));
        }
    }

    /// This endpoint's role.
    pub fn role(&self) -> Role {
        self.role
    }

    fn region(&self) -> &SharedRegion {
        unsafe { &*(self.shm.as_ptr() as *const SharedRegion) }
    }

    fn region_ptr(&self) -> *mut SharedRegion {
        self.shm.as_ptr() as *mut SharedRegion
    }

    fn check_index(&self, worker: usize) -> Result<()> {
        if worker < MAX_WORKERS {
            Ok(())
        } else {
            Err(SpindleError::ipc(format!(
                "worker index {} out of range (max {})",
                worker, MAX_WORKERS
            )))
        }
    }

    /// Enqueue a request payload for `worker`, blocking while the ring is
    /// full. Returns the allocated task id.
    pub fn enqueue(&self, worker: usize, payload: &[u8]) -> Result<u64> {
        self.enqueue_with(worker, payload, |_| {})
    }

    /// Like [`IpcEndpoint::enqueue`], but invokes `before_publish` with the
    /// allocated task id after the slot is written and before the worker is
    /// woken. Lets the caller register a response route with no window in
    /// which the worker could answer an unknown task.
    pub fn enqueue_with<F>(&self, worker: usize, payload: &[u8], before_publish: F) -> Result<u64>
    where
        F: FnOnce(u64),
    {
        self.check_index(worker)?;
        if payload.len() > MAX_PAYLOAD {
            return Err(SpindleError::TooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        if self.shutdown_requested() {
            return Err(SpindleError::Shutdown);
        }

        loop {
            match self.sems[worker].req_space.wait() {
                Ok(()) => break,
                Err(SpindleError::Interrupted) => {
                    if self.shutdown_requested() {
                        return Err(SpindleError::Shutdown);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let region = self.region();
        let task_id = {
            let _guard = self.enqueue_locks[worker].lock().unwrap();
            let task_id = region.next_task_id.fetch_add(1, Ordering::Relaxed);

            let ring = &region.rings[worker];
            let head = ring.head.load(Ordering::Relaxed);
            let idx = head as usize % RING_CAP_PER_WORKER;

            unsafe {
                let slot: *mut RequestSlot =
                    std::ptr::addr_of_mut!((*self.region_ptr()).rings[worker].slots[idx]);
                (*slot).task_id = task_id;
                (*slot).len = payload.len() as u32;
                (*slot).canceled.store(false, Ordering::Relaxed);
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    (*slot).payload.as_mut_ptr(),
                    payload.len(),
                );
                (*slot).payload[payload.len()] = 0;
            }

            ring.head.store(head + 1, Ordering::Release);
            before_publish(task_id);
            task_id
        };

        self.sems[worker].req_items.post()?;
        Ok(task_id)
    }

    /// Dequeue the next request for `worker`, blocking until one arrives.
    ///
    /// Returns [`SpindleError::Shutdown`] once the shutdown flag is set and
    /// [`SpindleError::Interrupted`] on a signal-interrupted wait, which the
    /// worker loop treats as a transient failure.
    pub fn dequeue(&self, worker: usize) -> Result<TaskRequest> {
        self.check_index(worker)?;
        if self.shutdown_requested() {
            return Err(SpindleError::Shutdown);
        }

        self.sems[worker].req_items.wait()?;

        if self.shutdown_requested() {
            return Err(SpindleError::Shutdown);
        }

        let region = self.region();
        let ring = &region.rings[worker];
        let tail = ring.tail.fetch_add(1, Ordering::AcqRel);
        let idx = tail as usize % RING_CAP_PER_WORKER;

        let request = unsafe {
            let slot: *const RequestSlot = std::ptr::addr_of!(region.rings[worker].slots[idx]);
            let len = ((*slot).len as usize).min(MAX_PAYLOAD);
            TaskRequest {
                task_id: (*slot).task_id,
                canceled: (*slot).canceled.load(Ordering::Acquire),
                payload: (&(*slot).payload)[..len].to_vec(),
            }
        };

        Ok(request)
    }

    /// Publish one response chunk from `worker`, blocking until the gateway
    /// has consumed the previous one.
    pub fn send_chunk(
        &self,
        worker: usize,
        task_id: u64,
        payload: &[u8],
        is_last: bool,
    ) -> Result<()> {
        self.check_index(worker)?;
        if payload.len() > MAX_PAYLOAD {
            return Err(SpindleError::TooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        loop {
            match self.sems[worker].resp_consumed.wait() {
                Ok(()) => break,
                Err(SpindleError::Interrupted) => {
                    if self.shutdown_requested() {
                        return Err(SpindleError::Shutdown);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        unsafe {
            let slot: *mut ResponseSlot =
                std::ptr::addr_of_mut!((*self.region_ptr()).response_slots[worker]);
            (*slot).len = payload.len() as u32;
            (*slot).is_last = is_last;
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                (*slot).payload.as_mut_ptr(),
                payload.len(),
            );
            (*slot).payload[payload.len()] = 0;
            (*slot).task_id.store(task_id, Ordering::Release);
        }

        self.sems[worker].resp.post()?;
        Ok(())
    }

    /// Wait up to `timeout` for the next chunk in `worker`'s mailbox.
    ///
    /// Consumes the mailbox unconditionally and signals `resp_consumed`, so
    /// the caller is responsible for routing the chunk to whoever owns its
    /// task id. Returns `Ok(None)` on timeout.
    pub fn recv_chunk(&self, worker: usize, timeout: Duration) -> Result<Option<ResponseChunk>> {
        self.check_index(worker)?;

        if !self.sems[worker].resp.timed_wait(timeout)? {
            return Ok(None);
        }

        let chunk = unsafe {
            let slot: *const ResponseSlot = std::ptr::addr_of!(self.region().response_slots[worker]);
            let task_id = (*slot).task_id.load(Ordering::Acquire);
            let len = ((*slot).len as usize).min(MAX_PAYLOAD);
            ResponseChunk {
                task_id,
                payload: (&(*slot).payload)[..len].to_vec(),
                is_last: (*slot).is_last,
            }
        };

        self.sems[worker].resp_consumed.post()?;
        Ok(Some(chunk))
    }

    /// Free one ring slot after a task has been fully handled. Called by the
    /// worker exactly once per successful [`IpcEndpoint::dequeue`].
    pub fn signal_request_handled(&self, worker: usize) -> Result<()> {
        self.check_index(worker)?;
        self.sems[worker].req_space.post()
    }

    /// Set the shutdown flag and wake every worker blocked in `dequeue`.
    pub fn request_shutdown(&self) {
        self.region().shutdown.store(true, Ordering::SeqCst);
        for sems in &self.sems {
            if let Err(e) = sems.req_items.post() {
                warn!("failed to wake worker for shutdown: {}", e);
            }
        }
    }

    /// Whether the shutdown flag is set.
    pub fn shutdown_requested(&self) -> bool {
        self.region().shutdown.load(Ordering::SeqCst)
    }

    /// Best-effort cancellation: flag the slot carrying `task_id` if the
    /// worker has not dequeued it yet.
    ///
    /// Runs under the enqueue lock so the scan cannot race other enqueues;
    /// it still races the worker's `tail` advance, and a cancellation lost
    /// to that race is acceptable.
    pub fn cancel(&self, worker: usize, task_id: u64) -> Result<CancelOutcome> {
        self.check_index(worker)?;
        let _guard = self.enqueue_locks[worker].lock().unwrap();

        let region = self.region();
        let ring = &region.rings[worker];
        let head = ring.head.load(Ordering::Acquire);
        let tail = ring.tail.load(Ordering::Acquire);

        for i in tail..head {
            let idx = i as usize % RING_CAP_PER_WORKER;
            unsafe {
                let slot: *const RequestSlot = std::ptr::addr_of!(region.rings[worker].slots[idx]);
                if (*slot).task_id == task_id {
                    (*slot).canceled.store(true, Ordering::Release);
                    if ring.tail.load(Ordering::Acquire) <= i {
                        return Ok(CancelOutcome::Canceled);
                    }
                    return Ok(CancelOutcome::NotFound);
                }
            }
        }

        Ok(CancelOutcome::NotFound)
    }

    /// Number of requests currently queued for `worker`, from the
    /// `req_items` semaphore value.
    pub fn queue_depth(&self, worker: usize) -> Result<usize> {
        self.check_index(worker)?;
        Ok(self.sems[worker].req_items.value()? as usize)
    }

    /// Racy occupancy snapshot of `worker`'s ring.
    pub fn ring_occupancy(&self, worker: usize) -> u64 {
        self.region().rings[worker].occupancy()
    }

    /// Whether the worker at `index` has attached to the region.
    pub fn worker_attached(&self, index: usize) -> bool {
        self.region().worker_attached[index].load(Ordering::Acquire)
    }

    /// Clear the attach flag before spawning a replacement worker.
    pub fn clear_worker_attached(&self, index: usize) {
        self.region().worker_attached[index].store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CHUNK_SIZE;
    use std::sync::atomic::{AtomicBool, Ordering as TestOrdering};
    use std::sync::Arc;
    use std::time::Instant;

    fn test_names(tag: &str) -> IpcNames {
        IpcNames::scoped(&format!("{}_{}", tag, std::process::id()))
    }

    #[test]
    fn test_enqueue_dequeue_roundtrip() {
        let names = test_names("roundtrip");
        let endpoint = IpcEndpoint::server(&names).unwrap();

        let task_id = endpoint.enqueue(0, b"5\x01hello there").unwrap();
        assert_eq!(task_id, 1);

        let request = endpoint.dequeue(0).unwrap();
        assert_eq!(request.task_id, 1);
        assert!(!request.canceled);
        assert_eq!(request.payload, b"5\x01hello there");
    }

    #[test]
    fn test_task_ids_monotonic_across_workers() {
        let names = test_names("monotonic");
        let endpoint = IpcEndpoint::server(&names).unwrap();

        let mut last = 0;
        for i in 0..12 {
            let id = endpoint.enqueue(i % 4, b"x").unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_payload_size_boundary() {
        let names = test_names("boundary");
        let endpoint = IpcEndpoint::server(&names).unwrap();

        let max_ok = vec![b'a'; MAX_PAYLOAD];
        endpoint.enqueue(0, &max_ok).unwrap();
        let request = endpoint.dequeue(0).unwrap();
        assert_eq!(request.payload.len(), MAX_PAYLOAD);

        let too_big = vec![b'a'; CHUNK_SIZE];
        match endpoint.enqueue(0, &too_big) {
            Err(SpindleError::TooLarge { len, max }) => {
                assert_eq!(len, CHUNK_SIZE);
                assert_eq!(max, MAX_PAYLOAD);
            }
            other => panic!("expected TooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_enqueue_blocks_when_ring_full() {
        let names = test_names("full");
        let endpoint = Arc::new(IpcEndpoint::server(&names).unwrap());

        for _ in 0..RING_CAP_PER_WORKER {
            endpoint.enqueue(0, b"fill").unwrap();
        }
        assert_eq!(endpoint.ring_occupancy(0), RING_CAP_PER_WORKER as u64);

        let entered = Arc::new(AtomicBool::new(false));
        let blocked = {
            let endpoint = Arc::clone(&endpoint);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                entered.store(true, TestOrdering::SeqCst);
                endpoint.enqueue(0, b"overflow")
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(entered.load(TestOrdering::SeqCst));
        assert!(!blocked.is_finished());

        // One slot frees up once a request is fully handled.
        endpoint.dequeue(0).unwrap();
        endpoint.signal_request_handled(0).unwrap();
        blocked.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_wakes_blocked_dequeue() {
        let names = test_names("shutdown");
        let endpoint = Arc::new(IpcEndpoint::server(&names).unwrap());

        let waiter = {
            let endpoint = Arc::clone(&endpoint);
            std::thread::spawn(move || endpoint.dequeue(2))
        };

        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        endpoint.request_shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(SpindleError::Shutdown)));
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(matches!(endpoint.dequeue(2), Err(SpindleError::Shutdown)));
        assert!(matches!(endpoint.enqueue(2, b"x"), Err(SpindleError::Shutdown)));
    }

    #[test]
    fn test_send_and_recv_chunk_preserves_order() {
        let names = test_names("chunks");
        let endpoint = Arc::new(IpcEndpoint::server(&names).unwrap());

        assert!(endpoint.recv_chunk(1, Duration::from_millis(20)).unwrap().is_none());

        let sender = {
            let endpoint = Arc::clone(&endpoint);
            std::thread::spawn(move || {
                for (i, piece) in [b"alpha".as_slice(), b"beta", b"gamma"].iter().enumerate() {
                    endpoint.send_chunk(1, 7, piece, i == 2).unwrap();
                }
            })
        };

        let mut got = Vec::new();
        loop {
            let chunk = endpoint
                .recv_chunk(1, Duration::from_secs(2))
                .unwrap()
                .expect("chunk expected");
            assert_eq!(chunk.task_id, 7);
            let last = chunk.is_last;
            got.push(chunk.payload);
            if last {
                break;
            }
        }

        sender.join().unwrap();
        assert_eq!(got, vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]);
    }

    #[test]
    fn test_cancel_before_and_after_dequeue() {
        let names = test_names("cancel");
        let endpoint = IpcEndpoint::server(&names).unwrap();

        let task_id = endpoint.enqueue(0, b"doomed").unwrap();
        assert_eq!(endpoint.cancel(0, task_id).unwrap(), CancelOutcome::Canceled);

        let request = endpoint.dequeue(0).unwrap();
        assert!(request.canceled);
        endpoint.signal_request_handled(0).unwrap();

        let task_id = endpoint.enqueue(0, b"served").unwrap();
        let request = endpoint.dequeue(0).unwrap();
        assert!(!request.canceled);
        assert_eq!(request.task_id, task_id);
        assert_eq!(endpoint.cancel(0, task_id).unwrap(), CancelOutcome::NotFound);
    }

    #[test]
    fn test_queue_depth_tracks_enqueues() {
        let names = test_names("depth");
        let endpoint = IpcEndpoint::server(&names).unwrap();

        assert_eq!(endpoint.queue_depth(3).unwrap(), 0);
        endpoint.enqueue(3, b"a").unwrap();
        endpoint.enqueue(3, b"b").unwrap();
        assert_eq!(endpoint.queue_depth(3).unwrap(), 2);

        endpoint.dequeue(3).unwrap();
        assert_eq!(endpoint.queue_depth(3).unwrap(), 1);
    }

    #[test]
    fn test_worker_role_attaches_and_verifies_magic() {
        let names = test_names("attach");
        let server = IpcEndpoint::server(&names).unwrap();
        assert!(!server.worker_attached(5));

        let worker = IpcEndpoint::worker(&names, 5).unwrap();
        assert_eq!(worker.role(), Role::Worker { index: 5 });
        assert!(server.worker_attached(5));

        server.clear_worker_attached(5);
        assert!(!server.worker_attached(5));

        drop(worker);
        drop(server);

        // With the server gone the names are unlinked.
        assert!(IpcEndpoint::worker(&names, 5).is_err());
    }

    #[test]
    fn test_server_recovers_from_stale_objects() {
        let names = test_names("stale");

        // Simulate a crashed previous run: create the objects and leak the
        // handles so nothing unlinks them.
        let stale_shm = SharedMemory::create(&names.shm_name, SharedRegion::size()).unwrap();
        let stale_sem = NamedSemaphore::create(&names.req_items(0), 0).unwrap();
        std::mem::forget(stale_shm);
        std::mem::forget(stale_sem);

        let endpoint = IpcEndpoint::server(&names).unwrap();
        let task_id = endpoint.enqueue(0, b"fresh").unwrap();
        assert_eq!(task_id, 1);
    }
}
