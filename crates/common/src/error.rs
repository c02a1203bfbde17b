//! Common error types for Spindle
//!
//! This module defines all error types used across the Spindle system.
//! Failures inside the IPC layer are reported as values and never panic;
//! the dispatcher turns the ones that reach a client into JSON error chunks.

use thiserror::Error;

/// Main error type for Spindle
#[derive(Error, Debug)]
pub enum SpindleError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared memory / semaphore errors
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Payload does not fit in a slot
    #[error("Payload too large: {len} bytes, limit {max}")]
    TooLarge { len: usize, max: usize },

    /// A blocking wait was interrupted by a signal; the caller retries
    #[error("Wait interrupted by signal")]
    Interrupted,

    /// Shutdown is in progress
    #[error("Shutdown in progress")]
    Shutdown,

    /// No worker could be assigned
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// A worker stopped responding mid-task
    #[error("Worker {index} crashed")]
    WorkerCrashed { index: usize },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpindleError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SpindleError::Config(msg.into())
    }

    /// Create an IPC error
    pub fn ipc(msg: impl Into<String>) -> Self {
        SpindleError::Ipc(msg.into())
    }

    /// Create an IPC error from the current OS error
    pub fn ipc_os(context: &str) -> Self {
        SpindleError::Ipc(format!("{}: {}", context, std::io::Error::last_os_error()))
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        SpindleError::WorkerUnavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        SpindleError::Timeout(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        SpindleError::Parse(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        SpindleError::Internal(msg.into())
    }

    /// Whether the caller should simply retry the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, SpindleError::Interrupted)
    }
}

/// Result type alias for Spindle operations
pub type Result<T> = std::result::Result<T, SpindleError>;
