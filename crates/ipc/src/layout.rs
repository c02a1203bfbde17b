//! Binary layout of the shared region.
//!
//! The region is a plain `#[repr(C)]` record mapped identically into the
//! gateway and every worker. All cross-process coordination fields are
//! atomics; everything else is owned by exactly one side at any given time
//! (see the field comments). The gateway initializes the region exactly once
//! right after creating it; workers verify the magic word instead of
//! re-initializing.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ magic                                                    │
//! ├──────────────────────────────────────────────────────────┤
//! │ rings[MAX_WORKERS]      head │ tail │ slots[RING_CAP]    │
//! ├──────────────────────────────────────────────────────────┤
//! │ response_slots[MAX_WORKERS]                              │
//! ├──────────────────────────────────────────────────────────┤
//! │ next_task_id │ shutdown │ worker_attached[MAX_WORKERS]   │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Hard upper bound on worker slots.
pub const MAX_WORKERS: usize = 8;

/// Depth of each worker's request ring. Must be a power of two so slot
/// indices can be computed with a mask.
pub const RING_CAP_PER_WORKER: usize = 32;

/// Slot payload capacity in bytes, including a reserved trailing NUL.
pub const CHUNK_SIZE: usize = 4096;

/// Largest payload that fits in a slot.
pub const MAX_PAYLOAD: usize = CHUNK_SIZE - 1;

/// Magic word written as the last step of region initialization.
/// ASCII "SPNDLRG1".
pub const REGION_MAGIC: u64 = 0x5350_4E44_4C52_4731;

const _: () = assert!(RING_CAP_PER_WORKER.is_power_of_two());
const _: () = assert!(CHUNK_SIZE > 1);

/// One queued request.
///
/// Written by the gateway before it advances `head`, read by the assigned
/// worker after it advances `tail`. Only `canceled` may be touched by the
/// gateway after publication.
#[repr(C)]
pub struct RequestSlot {
    pub task_id: u64,
    pub len: u32,
    pub canceled: AtomicBool,
    pub payload: [u8; CHUNK_SIZE],
}

/// Per-worker single-writer/single-reader response mailbox.
///
/// The worker writes only between the gateway's consumed signal and its own
/// ready signal; the gateway reads in the mirror window. The `resp` and
/// `resp_consumed` semaphores serialize the two sides.
#[repr(C)]
pub struct ResponseSlot {
    pub task_id: AtomicU64,
    pub len: u32,
    pub is_last: bool,
    pub payload: [u8; CHUNK_SIZE],
}

/// Bounded request ring for one worker.
#[repr(C)]
pub struct RequestRing {
    /// Monotonically increasing; written only by the gateway.
    pub head: AtomicU64,
    /// Monotonically increasing; written only by the owning worker.
    pub tail: AtomicU64,
    pub slots: [RequestSlot; RING_CAP_PER_WORKER],
}

impl RequestRing {
    /// Racy occupancy snapshot, bounded by `[0, RING_CAP_PER_WORKER]` for
    /// any single consistent observation.
    pub fn occupancy(&self) -> u64 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }
}

/// The whole shared region.
#[repr(C)]
pub struct SharedRegion {
    magic: AtomicU64,
    pub rings: [RequestRing; MAX_WORKERS],
    pub response_slots: [ResponseSlot; MAX_WORKERS],
    /// Next task id to hand out; starts at 1 so 0 can mean "none".
    pub next_task_id: AtomicU64,
    /// Set once by the gateway; workers observe it at every blocking point.
    pub shutdown: AtomicBool,
    /// Readiness flags: a worker sets its entry after mapping the region.
    pub worker_attached: [AtomicBool; MAX_WORKERS],
}

impl SharedRegion {
    /// Size of the mapping backing a region.
    pub const fn size() -> usize {
        std::mem::size_of::<SharedRegion>()
    }

    /// Initialize a freshly created (zero-filled) mapping.
    ///
    /// Called exactly once, by the gateway, right after `shm_open` +
    /// `ftruncate`. The magic word is stored last with release ordering so
    /// a worker that observes it also observes the initialized fields.
    ///
    /// # Safety
    /// `region` must point to a zero-filled, writable mapping of at least
    /// `SharedRegion::size()` bytes that no other process is accessing yet.
    pub unsafe fn initialize_in_place(region: *mut SharedRegion) {
        let region = &*region;
        region.next_task_id.store(1, Ordering::Relaxed);
        region.shutdown.store(false, Ordering::Relaxed);
        for ring in &region.rings {
            ring.head.store(0, Ordering::Relaxed);
            ring.tail.store(0, Ordering::Relaxed);
        }
        for attached in &region.worker_attached {
            attached.store(false, Ordering::Relaxed);
        }
        region.magic.store(REGION_MAGIC, Ordering::Release);
    }

    /// Whether the region has been initialized by a gateway.
    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == REGION_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_eight_byte_aligned() {
        assert_eq!(std::mem::align_of::<SharedRegion>(), 8);
        assert_eq!(std::mem::align_of::<RequestRing>(), 8);
    }

    #[test]
    fn test_initialize_in_place() {
        // A zeroed heap allocation models a fresh ftruncate'd mapping. The
        // region is too large to build on the test thread's stack.
        let layout = std::alloc::Layout::new::<SharedRegion>();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) } as *mut SharedRegion;
        let region: Box<SharedRegion> = unsafe { Box::from_raw(ptr) };
        assert!(!region.is_initialized());

        unsafe { SharedRegion::initialize_in_place(Box::as_ref(&region) as *const _ as *mut _) };
        assert!(region.is_initialized());
        assert_eq!(region.next_task_id.load(Ordering::Relaxed), 1);
        assert!(!region.shutdown.load(Ordering::Relaxed));
    }

    #[test]
    fn test_ring_occupancy_bounds() {
        let ring: RequestRing = unsafe { std::mem::zeroed() };
        assert_eq!(ring.occupancy(), 0);

        ring.head.store(5, Ordering::Release);
        ring.tail.store(2, Ordering::Release);
        assert_eq!(ring.occupancy(), 3);

        // A stale head snapshot must not underflow.
        ring.head.store(2, Ordering::Release);
        ring.tail.store(4, Ordering::Release);
        assert_eq!(ring.occupancy(), 0);
    }
}
