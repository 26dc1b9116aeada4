//! Pool-side setup of the pipe transport.
//!
//! Creates one FIFO per slot and owns the pid table. Only the process that
//! manages the pool's membership uses this; workers read the table through
//! [`PoolDescriptor`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, info, warn};

use super::{DEFAULT_BASE_PATH, WORKER_PIPE_PREFIX, WORKER_TABLE_FILE};
use crate::alert::{Pid, Slot};
use crate::config::PoolConfig;
use crate::directory::WorkerTable;

/// Configuration for an IPC pool.
#[derive(Debug, Clone)]
pub struct IpcPoolConfig {
    /// Directory holding the pipes and the pid table.
    pub base_path: PathBuf,
    /// Number of worker slots.
    pub workers: usize,
}

impl Default for IpcPoolConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(DEFAULT_BASE_PATH),
            workers: 1,
        }
    }
}

impl IpcPoolConfig {
    pub fn new(base_path: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            base_path: base_path.into(),
            workers,
        }
    }
}

impl From<&PoolConfig> for IpcPoolConfig {
    fn from(pool: &PoolConfig) -> Self {
        Self::new(&pool.base_path, pool.workers)
    }
}

/// Everything a worker needs to attach to a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDescriptor {
    pub base_path: PathBuf,
}

impl PoolDescriptor {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Path of the FIFO owned by `slot`.
    pub fn pipe_path(&self, slot: Slot) -> PathBuf {
        self.base_path
            .join(format!("{}{}.pipe", WORKER_PIPE_PREFIX, slot))
    }

    pub fn table_path(&self) -> PathBuf {
        self.base_path.join(WORKER_TABLE_FILE)
    }

    /// Read the current pid table.
    ///
    /// A missing or unreadable table is treated as an empty pool.
    pub fn load_table(&self) -> WorkerTable {
        let path = self.table_path();
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Pid table not readable");
                return WorkerTable::new();
            }
        };
        serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Failed to parse pid table");
            WorkerTable::new()
        })
    }
}

/// Owner of a pool's pipes and pid table.
pub struct IpcPool {
    config: IpcPoolConfig,
    descriptor: PoolDescriptor,
    table: WorkerTable,
}

impl IpcPool {
    /// Create the pool directory, one FIFO per slot and an empty pid table.
    ///
    /// Leftover pipes from a previous pool at the same path are replaced.
    pub fn new(config: IpcPoolConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.base_path)?;
        let descriptor = PoolDescriptor::new(&config.base_path);

        for slot in 0..config.workers as Slot {
            let pipe_path = descriptor.pipe_path(slot);
            if pipe_path.exists() {
                fs::remove_file(&pipe_path)?;
            }
            mkfifo(&pipe_path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::other)?;
            debug!(slot, pipe = %pipe_path.display(), "Created worker pipe");
        }

        let pool = Self {
            config,
            descriptor,
            table: WorkerTable::new(),
        };
        pool.persist()?;

        info!(
            base_path = %pool.config.base_path.display(),
            workers = pool.config.workers,
            "IPC pool initialized"
        );
        Ok(pool)
    }

    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    pub fn base_path(&self) -> &Path {
        &self.config.base_path
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn table(&self) -> &WorkerTable {
        &self.table
    }

    /// Record `pid` as the live worker in `slot`.
    pub fn register_worker(&mut self, slot: Slot, pid: Pid) -> io::Result<()> {
        if slot as usize >= self.config.workers {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("slot {} outside pool of {}", slot, self.config.workers),
            ));
        }
        let previous = self.table.insert(slot, pid);
        self.persist()?;
        info!(slot, pid, previous = ?previous, "Registered worker");
        Ok(())
    }

    /// Remove whoever occupies `slot` from the pid table.
    pub fn unregister_worker(&mut self, slot: Slot) -> io::Result<Option<Pid>> {
        let pid = self.table.remove_slot(slot);
        if pid.is_some() {
            self.persist()?;
            info!(slot, pid = ?pid, "Unregistered worker");
        }
        Ok(pid)
    }

    /// Write the table to a temporary file and rename it into place, so
    /// readers never observe a partial table.
    fn persist(&self) -> io::Result<()> {
        let path = self.descriptor.table_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(&self.table).map_err(io::Error::other)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)
    }

    /// Remove all pipes and the pid table.
    pub fn cleanup(&self) {
        for slot in 0..self.config.workers as Slot {
            let pipe_path = self.descriptor.pipe_path(slot);
            if pipe_path.exists() {
                let _ = fs::remove_file(&pipe_path);
            }
        }
        let _ = fs::remove_file(self.descriptor.table_path());
        // Only succeeds once nothing else lives in the directory
        let _ = fs::remove_dir(&self.config.base_path);
        info!("Cleaned up {} worker pipes", self.config.workers);
    }
}

impl Drop for IpcPool {
    fn drop(&mut self) {
        self.cleanup();
    }
}
