//! Spindle Gateway
//!
//! HTTP inference gateway: owns the shared-memory dispatch fabric, the
//! worker process pool and the streaming front end.

pub mod dispatcher;
pub mod http;
pub mod json;
pub mod manager;
pub mod monitor;
pub mod router;

pub use dispatcher::Dispatcher;
pub use manager::{WorkerManager, SCALE_CHECK_INTERVAL, WORKER_IDLE_TIMEOUT};
pub use monitor::Monitor;
pub use router::ResponseRouter;
