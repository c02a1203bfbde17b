//! Configuration structures for Spindle
//!
//! This module defines the configuration types used by the gateway and the
//! worker binary. Configuration is loaded from a YAML file and can be
//! overridden by environment variables; the keys mirror the ones the gateway
//! historically read (`WORKER_EXECUTABLE_PATH`, `MIN_WORKERS`, ...).

use crate::error::{Result, SpindleError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Well-known IPC object names.
///
/// The gateway creates these objects and forwards any overrides to spawned
/// workers through the environment, so both sides always agree on the names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcNames {
    /// POSIX shared memory object name
    #[serde(default = "default_shm_name")]
    pub shm_name: String,

    /// Per-worker request-items semaphore prefix
    #[serde(default = "default_req_items_prefix")]
    pub req_items_prefix: String,

    /// Per-worker request-space semaphore prefix
    #[serde(default = "default_req_space_prefix")]
    pub req_space_prefix: String,

    /// Per-worker response semaphore prefix
    #[serde(default = "default_resp_prefix")]
    pub resp_prefix: String,

    /// Per-worker response-consumed semaphore prefix
    #[serde(default = "default_resp_consumed_prefix")]
    pub resp_consumed_prefix: String,
}

impl Default for IpcNames {
    fn default() -> Self {
        Self {
            shm_name: default_shm_name(),
            req_items_prefix: default_req_items_prefix(),
            req_space_prefix: default_req_space_prefix(),
            resp_prefix: default_resp_prefix(),
            resp_consumed_prefix: default_resp_consumed_prefix(),
        }
    }
}

impl IpcNames {
    /// Names with a scope suffix appended, so independent instances
    /// (tests in particular) never collide on kernel object names.
    pub fn scoped(scope: &str) -> Self {
        let base = Self::default();
        Self {
            shm_name: format!("{}_{}", base.shm_name, scope),
            req_items_prefix: format!("{}{}_", base.req_items_prefix, scope),
            req_space_prefix: format!("{}{}_", base.req_space_prefix, scope),
            resp_prefix: format!("{}{}_", base.resp_prefix, scope),
            resp_consumed_prefix: format!("{}{}_", base.resp_consumed_prefix, scope),
        }
    }

    /// Apply overrides from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("SHM_NAME") {
            self.shm_name = value;
        }
        if let Ok(value) = std::env::var("SEM_REQ_ITEMS_PREFIX") {
            self.req_items_prefix = value;
        }
        if let Ok(value) = std::env::var("SEM_REQ_SPACE_PREFIX") {
            self.req_space_prefix = value;
        }
        if let Ok(value) = std::env::var("SEM_RESP_PREFIX") {
            self.resp_prefix = value;
        }
        if let Ok(value) = std::env::var("SEM_RESP_CONSUMED_PREFIX") {
            self.resp_consumed_prefix = value;
        }
    }

    /// Environment variable pairs a parent passes to worker children.
    pub fn env_overrides(&self) -> Vec<(&'static str, String)> {
        vec![
            ("SHM_NAME", self.shm_name.clone()),
            ("SEM_REQ_ITEMS_PREFIX", self.req_items_prefix.clone()),
            ("SEM_REQ_SPACE_PREFIX", self.req_space_prefix.clone()),
            ("SEM_RESP_PREFIX", self.resp_prefix.clone()),
            ("SEM_RESP_CONSUMED_PREFIX", self.resp_consumed_prefix.clone()),
        ]
    }

    /// Name of the request-items semaphore for worker `index`.
    pub fn req_items(&self, index: usize) -> String {
        format!("{}{}", self.req_items_prefix, index)
    }

    /// Name of the request-space semaphore for worker `index`.
    pub fn req_space(&self, index: usize) -> String {
        format!("{}{}", self.req_space_prefix, index)
    }

    /// Name of the response semaphore for worker `index`.
    pub fn resp(&self, index: usize) -> String {
        format!("{}{}", self.resp_prefix, index)
    }

    /// Name of the response-consumed semaphore for worker `index`.
    pub fn resp_consumed(&self, index: usize) -> String {
        format!("{}{}", self.resp_consumed_prefix, index)
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the worker executable
    #[serde(default = "default_worker_executable_path")]
    pub worker_executable_path: PathBuf,

    /// Number of workers kept alive at all times
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Upper bound for on-demand scale-up (clamped to the compiled-in
    /// worker slot count by the manager)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// IPC object names
    #[serde(default)]
    pub ipc: IpcNames,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            worker_executable_path: default_worker_executable_path(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            ipc: IpcNames::default(),
        }
    }
}

fn default_shm_name() -> String {
    "/inference_shm".to_string()
}

fn default_req_items_prefix() -> String {
    "/sem_req_items_".to_string()
}

fn default_req_space_prefix() -> String {
    "/sem_req_space_".to_string()
}

fn default_resp_prefix() -> String {
    "/sem_resp_".to_string()
}

fn default_resp_consumed_prefix() -> String {
    "/sem_resp_consumed_".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_worker_executable_path() -> PathBuf {
    PathBuf::from("./build/worker")
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    4
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SpindleError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: GatewayConfig = serde_yaml::from_str(&content).map_err(|e| {
            SpindleError::config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("SPINDLE_BIND_ADDRESS") {
            self.bind_address = value;
        }
        if let Ok(value) = std::env::var("SPINDLE_PORT") {
            self.port = value
                .parse()
                .map_err(|_| SpindleError::config("Invalid SPINDLE_PORT value"))?;
        }
        if let Ok(value) = std::env::var("WORKER_EXECUTABLE_PATH") {
            self.worker_executable_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("MIN_WORKERS") {
            self.min_workers = value
                .parse()
                .map_err(|_| SpindleError::config("Invalid MIN_WORKERS value"))?;
        }
        if let Ok(value) = std::env::var("MAX_WORKERS_DYNAMIC") {
            self.max_workers = value
                .parse()
                .map_err(|_| SpindleError::config("Invalid MAX_WORKERS_DYNAMIC value"))?;
        }
        self.ipc.apply_env();
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(SpindleError::config("min_workers must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            return Err(SpindleError::config(format!(
                "max_workers ({}) must be >= min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if !self.ipc.shm_name.starts_with('/') {
            return Err(SpindleError::config("shm_name must start with '/'"));
        }
        Ok(())
    }
}
