//! Spindle IPC
//!
//! Shared-memory dispatch fabric between the gateway and its worker
//! processes: a fixed binary region layout, per-worker bounded request
//! rings, per-worker response mailboxes and the named semaphores that
//! serialize them.

pub mod endpoint;
pub mod layout;
pub mod sem;
pub mod shm;

pub use endpoint::{CancelOutcome, IpcEndpoint, ResponseChunk, Role, TaskRequest};
pub use layout::{
    SharedRegion, CHUNK_SIZE, MAX_PAYLOAD, MAX_WORKERS, RING_CAP_PER_WORKER,
};
pub use sem::NamedSemaphore;
pub use shm::SharedMemory;
