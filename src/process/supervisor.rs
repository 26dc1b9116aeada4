//! Pool supervisor.
//!
//! Owns the [`IpcPool`] and one [`ManagedWorker`] per slot. A worker that
//! exits is replaced by a fresh process in the same slot; the pid table is
//! rewritten so addressing by slot follows the new pid.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use super::{ManagedWorker, ProcessError, WorkerEnv, SHUTDOWN_GRACE};
use crate::alert::Slot;
use crate::bus::ipc::{IpcPool, IpcPoolConfig};

/// Interval between checks for exited workers.
pub const REAP_INTERVAL: Duration = Duration::from_millis(200);

/// Spawns, watches and stops the workers of one pool.
pub struct PoolSupervisor {
    pool: IpcPool,
    command: Vec<String>,
    workers: BTreeMap<Slot, ManagedWorker>,
}

impl PoolSupervisor {
    /// Create the pool's pipes. No workers are started yet.
    pub fn new(config: IpcPoolConfig, command: Vec<String>) -> Result<Self, ProcessError> {
        if command.is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        let pool = IpcPool::new(config)?;
        Ok(Self {
            pool,
            command,
            workers: BTreeMap::new(),
        })
    }

    pub fn pool(&self) -> &IpcPool {
        &self.pool
    }

    /// Pid of the worker currently in `slot`.
    pub fn worker_pid(&self, slot: Slot) -> Option<crate::alert::Pid> {
        self.workers.get(&slot).map(ManagedWorker::pid)
    }

    /// Start a worker in every slot.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        for slot in 0..self.pool.workers() as Slot {
            self.spawn_slot(slot)?;
        }
        info!(workers = self.workers.len(), "All workers started");
        Ok(())
    }

    fn spawn_slot(&mut self, slot: Slot) -> Result<(), ProcessError> {
        let env = WorkerEnv::new(slot, self.pool.base_path());
        let worker = ManagedWorker::spawn(&self.command, &env)?;
        self.pool.register_worker(slot, worker.pid())?;
        self.workers.insert(slot, worker);
        Ok(())
    }

    /// Replace every worker that has exited. Returns the respawned slots.
    pub fn reap(&mut self) -> Vec<Slot> {
        let exited: Vec<Slot> = self
            .workers
            .iter_mut()
            .filter_map(|(slot, worker)| {
                worker.try_status().map(|status| {
                    warn!(slot = *slot, pid = worker.pid(), status = ?status, "Worker exited");
                    *slot
                })
            })
            .collect();

        for slot in &exited {
            if let Err(e) = self.pool.unregister_worker(*slot) {
                warn!(slot = *slot, error = %e, "Failed to unregister worker");
            }
            self.workers.remove(slot);
            if let Err(e) = self.spawn_slot(*slot) {
                error!(slot = *slot, error = %e, "Failed to respawn worker");
            }
        }
        exited
    }

    /// Supervise workers until `shutdown` resolves, then stop them all.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(REAP_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.reap();
                }
            }
        }

        self.shutdown().await;
    }

    /// SIGTERM every worker, wait for them to exit and clear the pid table.
    pub async fn shutdown(&mut self) {
        info!(workers = self.workers.len(), "Shutting down workers");
        for worker in self.workers.values_mut() {
            worker.shutdown(SHUTDOWN_GRACE).await;
        }
        for slot in std::mem::take(&mut self.workers).into_keys() {
            let _ = self.pool.unregister_worker(slot);
        }
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sleeper() -> Vec<String> {
        vec!["sleep".to_string(), "30".to_string()]
    }

    #[tokio::test]
    async fn test_start_registers_every_slot() {
        let dir = TempDir::new().unwrap();
        let mut supervisor =
            PoolSupervisor::new(IpcPoolConfig::new(dir.path(), 3), sleeper()).unwrap();
        supervisor.start().unwrap();

        let table = supervisor.pool().descriptor().load_table();
        assert_eq!(table.len(), 3);
        for slot in 0..3 {
            assert_eq!(table.pid_of(slot), supervisor.worker_pid(slot));
        }

        supervisor.shutdown().await;
        assert!(supervisor.pool().descriptor().load_table().is_empty());
    }

    #[tokio::test]
    async fn test_exited_worker_is_respawned_in_same_slot() {
        let dir = TempDir::new().unwrap();
        let mut supervisor =
            PoolSupervisor::new(IpcPoolConfig::new(dir.path(), 2), sleeper()).unwrap();
        supervisor.start().unwrap();

        let old_pid = supervisor.worker_pid(1).unwrap();
        supervisor.workers.get_mut(&1).unwrap().shutdown(SHUTDOWN_GRACE).await;

        assert_eq!(supervisor.reap(), vec![1]);
        let new_pid = supervisor.worker_pid(1).unwrap();
        assert_ne!(new_pid, old_pid);

        let table = supervisor.pool().descriptor().load_table();
        assert_eq!(table.pid_of(1), Some(new_pid));
        assert_eq!(table.slot_of(old_pid), None);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_until_stops_workers() {
        let dir = TempDir::new().unwrap();
        let mut supervisor =
            PoolSupervisor::new(IpcPoolConfig::new(dir.path(), 1), sleeper()).unwrap();
        supervisor.start().unwrap();

        supervisor
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await;
        assert!(supervisor.worker_pid(0).is_none());
    }

    #[test]
    fn test_empty_command_rejected() {
        let dir = TempDir::new().unwrap();
        let result = PoolSupervisor::new(IpcPoolConfig::new(dir.path(), 1), Vec::new());
        assert!(matches!(result, Err(ProcessError::EmptyCommand)));
    }
}
