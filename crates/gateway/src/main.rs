//! Spindle Gateway - Main Entry Point
//!
//! Creates the shared-memory fabric, spawns the initial worker pool, then
//! serves streaming inference requests over HTTP until interrupted.

use spindle_common::{GatewayConfig, Result};
use spindle_gateway::{Dispatcher, Monitor, ResponseRouter, WorkerManager};
use spindle_ipc::IpcEndpoint;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spindle_gateway=info,spindle_ipc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Spindle Gateway");

    let config_path = std::env::var("SPINDLE_CONFIG").ok().map(PathBuf::from);
    let config = GatewayConfig::load(config_path.as_deref())?;

    info!(
        bind = %config.bind_address,
        port = config.port,
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        "configuration loaded"
    );

    // IPC first: stale objects from a crashed run are replaced here.
    let ipc = Arc::new(IpcEndpoint::server(&config.ipc)?);

    let manager = Arc::new(WorkerManager::new(Arc::clone(&ipc), &config));
    manager.initialize()?;

    let router = Arc::new(ResponseRouter::start(Arc::clone(&ipc)));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&ipc),
        Arc::clone(&manager),
        Arc::clone(&router),
    ));
    let monitor = Monitor::start(Arc::clone(&manager));

    let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
    info!("Spindle Gateway listening on {}:{}", config.bind_address, config.port);

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = spindle_gateway::http::serve(listener, Arc::clone(&dispatcher)) => {
            if let Err(e) = result {
                error!("HTTP front end failed: {}", e);
            }
        }
    }

    // Ordered shutdown: flag the workers awake, stop the background loops,
    // terminate the pool, then drop the endpoint, which unlinks the names.
    ipc.request_shutdown();
    monitor.stop();
    manager.shutdown();
    router.stop();

    info!("Spindle Gateway shutdown complete");
    Ok(())
}
