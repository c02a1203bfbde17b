//! Spindle Worker
//!
//! Worker process for the Spindle inference gateway. Each worker attaches
//! to the gateway's shared region, serves its own request ring and streams
//! generated tokens back through its response mailbox.

pub mod model;
pub mod runtime;

pub use model::{LanguageModel, TinyModel};
pub use runtime::{WorkerRuntime, MAX_TOKENS_HARD_CAP};
