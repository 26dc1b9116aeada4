//! In-memory channel transport.
//!
//! Simulates a pool of workers inside a single process: every worker gets a
//! bounded mailbox keyed by a synthetic pid. Useful for tests and for
//! embedding the bus where workers are threads rather than processes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::{BroadcastScope, ReceivedAlert, Transport, TransportError};
use crate::alert::{Alert, Pid, Slot};
use crate::directory::{WorkerIdentity, WorkerTable};

/// Mailbox capacity per worker.
const CHANNEL_CAPACITY: usize = 1024;

/// First synthetic pid handed out.
const BASE_PID: Pid = 10_000;

struct PoolState {
    table: WorkerTable,
    mailboxes: HashMap<Pid, VecDeque<ReceivedAlert>>,
    capacity: usize,
    next_pid: Pid,
}

impl PoolState {
    fn spawn(&mut self, slot: Slot) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        if let Some(previous) = self.table.insert(slot, pid) {
            self.mailboxes.remove(&previous);
        }
        self.mailboxes.insert(pid, VecDeque::new());
        pid
    }

    fn enqueue(&mut self, sender: WorkerIdentity, pid: Pid, alert: &Alert) -> Result<(), TransportError> {
        let capacity = self.capacity;
        let mailbox = self
            .mailboxes
            .get_mut(&pid)
            .ok_or_else(|| TransportError::NoSuchWorker(format!("pid {}", pid)))?;
        if mailbox.len() >= capacity {
            return Err(TransportError::Full(format!("pid {}", pid)));
        }
        mailbox.push_back(ReceivedAlert::new(sender, alert.clone()));
        Ok(())
    }
}

/// A simulated worker pool; hands out one [`ChannelTransport`] per slot.
#[derive(Clone)]
pub struct ChannelPool {
    state: Arc<Mutex<PoolState>>,
}

impl ChannelPool {
    /// Create a pool with `workers` live workers in slots `0..workers`.
    pub fn new(workers: usize) -> Self {
        Self::with_capacity(workers, CHANNEL_CAPACITY)
    }

    /// Create a pool whose mailboxes hold at most `capacity` alerts.
    pub fn with_capacity(workers: usize, capacity: usize) -> Self {
        let mut state = PoolState {
            table: WorkerTable::new(),
            mailboxes: HashMap::new(),
            capacity,
            next_pid: BASE_PID,
        };
        for slot in 0..workers as Slot {
            state.spawn(slot);
        }

        info!(workers, capacity, "Channel pool initialized");

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        lock_state(&self.state)
    }

    /// Transport for the worker currently in `slot`.
    pub fn transport(&self, slot: Slot) -> Option<ChannelTransport> {
        let pid = self.lock().table.pid_of(slot)?;
        Some(ChannelTransport {
            state: Arc::clone(&self.state),
            identity: WorkerIdentity::new(pid, slot),
        })
    }

    /// Transports for every live worker, in slot order.
    pub fn transports(&self) -> Vec<ChannelTransport> {
        let identities: Vec<WorkerIdentity> = self.lock().table.identities().collect();
        identities
            .into_iter()
            .map(|identity| ChannelTransport {
                state: Arc::clone(&self.state),
                identity,
            })
            .collect()
    }

    /// Simulate the worker in `slot` exiting. Its pending alerts are lost.
    pub fn stop_worker(&self, slot: Slot) -> Option<Pid> {
        let mut state = self.lock();
        let pid = state.table.remove_slot(slot)?;
        state.mailboxes.remove(&pid);
        debug!(slot, pid, "Channel worker stopped");
        Some(pid)
    }

    /// Start a fresh worker in `slot` with a new pid.
    pub fn restart_worker(&self, slot: Slot) -> Pid {
        let pid = self.lock().spawn(slot);
        debug!(slot, pid, "Channel worker started");
        pid
    }

    /// Snapshot of live workers.
    pub fn table(&self) -> WorkerTable {
        self.lock().table.clone()
    }

    /// Number of undelivered alerts waiting for `pid`.
    pub fn pending(&self, pid: Pid) -> usize {
        self.lock().mailboxes.get(&pid).map_or(0, VecDeque::len)
    }
}

fn lock_state(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One worker's view of a [`ChannelPool`].
#[derive(Clone)]
pub struct ChannelTransport {
    state: Arc<Mutex<PoolState>>,
    identity: WorkerIdentity,
}

impl Transport for ChannelTransport {
    fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    fn send_to_pid(&self, pid: Pid, alert: &Alert) -> Result<(), TransportError> {
        lock_state(&self.state).enqueue(self.identity, pid, alert)
    }

    fn send_to_slot(&self, slot: Slot, alert: &Alert) -> Result<(), TransportError> {
        let mut state = lock_state(&self.state);
        let pid = state
            .table
            .pid_of(slot)
            .ok_or_else(|| TransportError::NoSuchWorker(format!("slot {}", slot)))?;
        state.enqueue(self.identity, pid, alert)
    }

    fn broadcast(&self, alert: &Alert, scope: BroadcastScope) -> Result<(), TransportError> {
        let mut state = lock_state(&self.state);
        let targets: Vec<Pid> = state
            .table
            .pids()
            .into_iter()
            .filter(|pid| scope.reaches(self.identity.pid, *pid))
            .collect();

        let mut failed = 0;
        let mut first_error = None;
        for pid in targets {
            if let Err(e) = state.enqueue(self.identity, pid, alert) {
                failed += 1;
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                debug!(failed, name = %alert.name(), "Broadcast incomplete");
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn get_slot(&self, pid: Pid) -> Option<Slot> {
        lock_state(&self.state).table.slot_of(pid)
    }

    fn get_pid(&self, slot: Slot) -> Option<Pid> {
        lock_state(&self.state).table.pid_of(slot)
    }

    fn worker_pids(&self) -> Vec<Pid> {
        lock_state(&self.state).table.pids()
    }

    fn receive(&self) -> Result<Vec<ReceivedAlert>, TransportError> {
        let mut state = lock_state(&self.state);
        let mailbox = state.mailboxes.get_mut(&self.identity.pid).ok_or_else(|| {
            TransportError::Closed(format!("worker pid {} is no longer live", self.identity.pid))
        })?;
        Ok(mailbox.drain(..).collect())
    }
}
