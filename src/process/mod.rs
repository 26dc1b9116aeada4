//! Process management for the worker pool.
//!
//! Spawns worker processes, passes each its slot and the pool location as
//! environment variables, and manages their lifecycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::alert::{Pid, Slot};
use crate::config::{LOG_ENV_VAR, POOL_PATH_ENV_VAR, WORKER_SLOT_ENV_VAR};

pub mod supervisor;
#[cfg(feature = "lua")]
pub mod worker;

pub use supervisor::PoolSupervisor;
#[cfg(feature = "lua")]
pub use worker::run_worker;

/// How long a worker gets to exit after SIGTERM before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Errors from spawning or signalling workers.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command array cannot be empty")]
    EmptyCommand,

    #[error("Failed to spawn worker for slot {slot}: {source}")]
    Spawn {
        slot: Slot,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker for slot {0} exited before reporting a pid")]
    NoPid(Slot),

    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("Environment variable {var} has invalid value '{value}'")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Environment variables passed to spawned workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    /// Slot the worker owns.
    pub slot: Slot,
    /// Directory holding the pool's pipes and pid table.
    pub pool_path: PathBuf,
    /// Log filter forwarded from the supervisor.
    pub log: Option<String>,
}

impl WorkerEnv {
    pub fn new(slot: Slot, pool_path: impl Into<PathBuf>) -> Self {
        Self {
            slot,
            pool_path: pool_path.into(),
            log: std::env::var(LOG_ENV_VAR).ok(),
        }
    }

    /// Read the worker environment of the current process.
    ///
    /// Returns `Ok(None)` when the process was not started as a pool worker.
    pub fn from_env() -> Result<Option<Self>, ProcessError> {
        let Ok(slot) = std::env::var(WORKER_SLOT_ENV_VAR) else {
            return Ok(None);
        };
        let slot = slot.parse().map_err(|_| ProcessError::InvalidEnv {
            var: WORKER_SLOT_ENV_VAR,
            value: slot.clone(),
        })?;
        let pool_path = std::env::var(POOL_PATH_ENV_VAR)
            .map_err(|_| ProcessError::MissingEnv(POOL_PATH_ENV_VAR))?;

        Ok(Some(Self {
            slot,
            pool_path: PathBuf::from(pool_path),
            log: std::env::var(LOG_ENV_VAR).ok(),
        }))
    }

    /// Convert to environment variable map.
    pub fn to_env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(WORKER_SLOT_ENV_VAR.to_string(), self.slot.to_string());
        env.insert(
            POOL_PATH_ENV_VAR.to_string(),
            self.pool_path.to_string_lossy().to_string(),
        );

        if let Some(ref log) = self.log {
            env.insert(LOG_ENV_VAR.to_string(), log.clone());
        }

        env
    }
}

/// Send `signal` to a single process.
pub fn signal_process(pid: Pid, signal: Signal) -> Result<(), ProcessError> {
    kill(NixPid::from_raw(pid), signal).map_err(|source| ProcessError::Signal { pid, source })
}

/// A spawned worker process.
pub struct ManagedWorker {
    child: Child,
    slot: Slot,
    pid: Pid,
}

impl ManagedWorker {
    /// Spawn a worker for `env.slot`.
    ///
    /// Command is an array where the first element is the executable and
    /// the rest are arguments. No shell interpretation - direct exec.
    pub fn spawn(command: &[String], env: &WorkerEnv) -> Result<Self, ProcessError> {
        let (executable, args) = command.split_first().ok_or(ProcessError::EmptyCommand)?;

        let env_vars = env.to_env_vars();
        debug!(slot = env.slot, ?env_vars, "Worker environment");

        let mut cmd = Command::new(executable);
        cmd.args(args);
        for (key, value) in env_vars {
            cmd.env(&key, &value);
        }

        // Output is inherited so worker logs interleave with the supervisor's
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.stdin(Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            error!(executable = %executable, slot = env.slot, error = %e, "Failed to spawn worker");
            ProcessError::Spawn {
                slot: env.slot,
                source: e,
            }
        })?;
        let pid = child.id().ok_or(ProcessError::NoPid(env.slot))? as Pid;

        info!(slot = env.slot, pid, "Worker spawned");

        Ok(Self {
            child,
            slot: env.slot,
            pid,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Exit status, if the worker has exited.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                error!(slot = self.slot, pid = self.pid, error = %e, "Failed to check worker status");
                None
            }
        }
    }

    /// Check if the worker is still running.
    pub fn is_running(&mut self) -> bool {
        self.try_status().is_none()
    }

    /// Ask the worker to exit.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        signal_process(self.pid, Signal::SIGTERM)
    }

    /// Send SIGTERM, then SIGKILL if the worker outlives `grace`.
    pub async fn shutdown(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        info!(slot = self.slot, pid = self.pid, "Stopping worker");

        if let Err(e) = self.terminate() {
            warn!(slot = self.slot, error = %e, "Failed to send SIGTERM to worker");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(slot = self.slot, pid = self.pid, status = ?status, "Worker exited");
            }
            Ok(Err(e)) => {
                warn!(slot = self.slot, error = %e, "Error waiting for worker");
            }
            Err(_) => {
                warn!(slot = self.slot, pid = self.pid, "Worker didn't exit gracefully, sending SIGKILL");
                let _ = self.child.kill().await;
            }
        }
    }
}

impl Drop for ManagedWorker {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(slot = self.slot, pid = self.pid, "Killing orphaned worker on drop");
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_worker_env_to_env_vars() {
        let env = WorkerEnv {
            slot: 3,
            pool_path: PathBuf::from("/tmp/alertbus"),
            log: Some("debug".to_string()),
        };

        let vars = env.to_env_vars();
        assert_eq!(vars.get(WORKER_SLOT_ENV_VAR), Some(&"3".to_string()));
        assert_eq!(vars.get(POOL_PATH_ENV_VAR), Some(&"/tmp/alertbus".to_string()));
        assert_eq!(vars.get(LOG_ENV_VAR), Some(&"debug".to_string()));
    }

    #[test]
    #[serial]
    fn test_worker_env_from_env() {
        std::env::remove_var(WORKER_SLOT_ENV_VAR);
        assert_eq!(WorkerEnv::from_env().unwrap(), None);

        std::env::set_var(WORKER_SLOT_ENV_VAR, "2");
        std::env::set_var(POOL_PATH_ENV_VAR, "/run/pool");
        let env = WorkerEnv::from_env();
        std::env::set_var(WORKER_SLOT_ENV_VAR, "two");
        let invalid = WorkerEnv::from_env();
        std::env::remove_var(WORKER_SLOT_ENV_VAR);
        std::env::remove_var(POOL_PATH_ENV_VAR);

        let env = env.unwrap().unwrap();
        assert_eq!(env.slot, 2);
        assert_eq!(env.pool_path, PathBuf::from("/run/pool"));
        assert!(matches!(invalid, Err(ProcessError::InvalidEnv { .. })));
    }

    #[test]
    fn test_spawn_empty_command() {
        let result = ManagedWorker::spawn(&[], &WorkerEnv::new(0, "/tmp/alertbus"));
        assert!(matches!(result, Err(ProcessError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_spawn_passes_environment() {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("test \"${}\" = 5", WORKER_SLOT_ENV_VAR),
        ];
        let mut worker = ManagedWorker::spawn(&command, &WorkerEnv::new(5, "/tmp/x")).unwrap();
        assert_eq!(worker.slot(), 5);
        assert!(worker.pid() > 0);

        let status = worker.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_shutdown_terminates_worker() {
        let command = vec!["sleep".to_string(), "30".to_string()];
        let mut worker = ManagedWorker::spawn(&command, &WorkerEnv::new(0, "/tmp/x")).unwrap();
        assert!(worker.is_running());

        worker.shutdown(SHUTDOWN_GRACE).await;
        assert!(!worker.is_running());
    }
}
