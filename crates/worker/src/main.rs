//! Spindle Worker - Main Entry Point
//!
//! Attaches to the gateway's shared region and serves one request ring.
//! The gateway spawns this binary with `--index=<i>` and redirects its
//! stdout/stderr to a null sink, so log output is only visible when the
//! worker is run by hand.

use clap::Parser;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use spindle_common::{IpcNames, Result, SpindleError};
use spindle_ipc::IpcEndpoint;
use spindle_worker::runtime::{WorkerRuntime, TERM_REQUESTED};
use spindle_worker::TinyModel;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Spindle inference worker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker slot index assigned by the gateway
    #[arg(long)]
    index: usize,
}

extern "C" fn handle_term(_signal: nix::libc::c_int) {
    TERM_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_term_handler() -> Result<()> {
    // No SA_RESTART: a pending SIGTERM must interrupt semaphore waits so
    // the loop can observe the flag.
    let action = SigAction::new(SigHandler::Handler(handle_term), SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGTERM, &action) }
        .map_err(|e| SpindleError::internal(format!("sigaction failed: {}", e)))?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spindle_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    install_term_handler()?;

    let mut names = IpcNames::default();
    names.apply_env();

    let ipc = Arc::new(IpcEndpoint::worker(&names, args.index)?);
    info!(index = args.index, "worker initialized, waiting for tasks");

    let mut runtime = WorkerRuntime::new(ipc, args.index, TinyModel::new());
    runtime.run()?;

    Ok(())
}
