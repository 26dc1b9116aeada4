//! alertbus-pool: worker pool with a Lua-scripted alert bus
//!
//! Started without worker environment, the process is the pool supervisor:
//! it creates the pipes, spawns one copy of itself per slot and respawns
//! workers that exit. Each copy sees `ALERTBUS_WORKER_SLOT` and runs as a
//! worker instead.
//!
//! ## Architecture
//! ```text
//! [alertbus-pool] --spawn--> [worker 0] <--pipes--> [worker 1] ...
//!        |                        |
//!        v                        v
//!   workers.json             init script (Lua)
//! ```
//!
//! ## Configuration
//! - ALERTBUS_CONFIG: Path to YAML config file (optional)
//! - ALERTBUS__POOL__WORKERS: Number of workers (default: 4)
//! - ALERTBUS__SCRIPT__INIT_FILE: Lua script run by every worker at startup
//! - ALERTBUS_LOG: Log filter (default: info)

use tracing::{error, info};

use alertbus::bus::ipc::IpcPoolConfig;
use alertbus::config::Config;
use alertbus::process::{run_worker, PoolSupervisor, WorkerEnv};
use alertbus::utils::bootstrap::{init_tracing, self_command};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;

    if let Some(env) = WorkerEnv::from_env()? {
        if let Err(e) = run_worker(&config, &env) {
            error!(slot = env.slot, error = %e, "Worker failed");
            return Err(e.into());
        }
        return Ok(());
    }

    run_supervisor(config)
}

#[tokio::main]
async fn run_supervisor(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut supervisor = PoolSupervisor::new(IpcPoolConfig::from(&config.pool), self_command()?)?;
    supervisor.start()?;

    info!(
        workers = config.pool.workers,
        base_path = %config.pool.base_path.display(),
        "alertbus-pool started"
    );
    info!("Press Ctrl+C to exit");

    supervisor
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await;

    Ok(())
}
