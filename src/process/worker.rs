//! Worker process main loop.
//!
//! Each worker attaches to its slot's pipe, builds its alert bus and script
//! host, runs the init script, then dispatches alerts whenever the pipe
//! becomes readable until SIGTERM arrives.

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use super::WorkerEnv;
use crate::bus::ipc::{IpcTransport, PoolDescriptor};
use crate::bus::{AlertBus, TransportError};
use crate::config::Config;
use crate::script::{ScriptError, ScriptHost};

/// Errors that end a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a worker until it receives SIGTERM.
///
/// Builds a single-threaded runtime; the bus and the Lua state never leave
/// this thread.
pub fn run_worker(config: &Config, env: &WorkerEnv) -> Result<(), WorkerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(worker_loop(config, env))
}

async fn worker_loop(config: &Config, env: &WorkerEnv) -> Result<(), WorkerError> {
    let transport = IpcTransport::init_for_worker(PoolDescriptor::new(&env.pool_path), env.slot)?;
    let readable = AsyncFd::with_interest(transport.reader_fd(), Interest::READABLE)?;

    let bus = AlertBus::new(transport, config.bus.clone()).shared();
    let host = ScriptHost::new(&bus, &config.script)?;

    if let Some(init_file) = &config.script.init_file {
        // A broken init script leaves the worker running with no handlers.
        if let Err(e) = host.run_init_file(init_file) {
            warn!(path = %init_file.display(), error = %e, "Worker running without init script");
        }
    }

    let mut terminate = signal(SignalKind::terminate())?;
    info!(slot = env.slot, pid = bus.identity().pid, "Worker ready");

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                info!(slot = env.slot, "Received SIGTERM, stopping worker");
                break;
            }
            guard = readable.readable() => {
                let mut guard = guard?;
                guard.clear_ready();
                if let Err(e) = bus.poll() {
                    error!(slot = env.slot, error = %e, "Failed to drain worker pipe");
                }
            }
        }
    }

    drop(host);
    drop(readable);
    drop(bus);
    Ok(())
}
