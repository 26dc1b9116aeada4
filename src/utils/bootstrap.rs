//! Bootstrap utilities for alertbus binaries.
//!
//! Shared initialization code for the pool supervisor and its workers.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with ALERTBUS_LOG environment variable.
///
/// Defaults to "info" level if ALERTBUS_LOG is not set. Calling this more than
/// once is harmless; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Command that re-executes the current binary, used to spawn workers.
pub fn self_command() -> std::io::Result<Vec<String>> {
    let exe = std::env::current_exe()?;
    let mut command = vec![exe.to_string_lossy().to_string()];
    command.extend(std::env::args().skip(1));
    Ok(command)
}
