//! Worker identity directory.
//!
//! Maps OS process ids to pool slots for every live worker. The table itself
//! is a snapshot owned by the transport and refreshed by whoever manages the
//! pool's membership; [`Directory`] only reads it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::alert::{Pid, Slot};
use crate::bus::Transport;

/// Identity of one pool worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub pid: Pid,
    pub slot: Slot,
}

impl WorkerIdentity {
    pub fn new(pid: Pid, slot: Slot) -> Self {
        Self { pid, slot }
    }
}

/// Snapshot of live workers, ordered by slot.
///
/// Slots are unique keys. A pid appears at most once; assigning a pid to a new
/// slot evicts its previous entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<WorkerIdentity>", into = "Vec<WorkerIdentity>")]
pub struct WorkerTable {
    slots: BTreeMap<Slot, Pid>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pid` as the occupant of `slot`, returning the previous occupant.
    pub fn insert(&mut self, slot: Slot, pid: Pid) -> Option<Pid> {
        self.slots.retain(|s, p| *p != pid || *s == slot);
        self.slots.insert(slot, pid)
    }

    /// Forget whoever occupies `slot`.
    pub fn remove_slot(&mut self, slot: Slot) -> Option<Pid> {
        self.slots.remove(&slot)
    }

    pub fn slot_of(&self, pid: Pid) -> Option<Slot> {
        self.slots
            .iter()
            .find_map(|(slot, p)| (*p == pid).then_some(*slot))
    }

    pub fn pid_of(&self, slot: Slot) -> Option<Pid> {
        self.slots.get(&slot).copied()
    }

    /// Live pids in slot order.
    pub fn pids(&self) -> Vec<Pid> {
        self.slots.values().copied().collect()
    }

    pub fn identities(&self) -> impl Iterator<Item = WorkerIdentity> + '_ {
        self.slots
            .iter()
            .map(|(slot, pid)| WorkerIdentity::new(*pid, *slot))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl From<Vec<WorkerIdentity>> for WorkerTable {
    fn from(workers: Vec<WorkerIdentity>) -> Self {
        let mut table = WorkerTable::new();
        for worker in workers {
            table.insert(worker.slot, worker.pid);
        }
        table
    }
}

impl From<WorkerTable> for Vec<WorkerIdentity> {
    fn from(table: WorkerTable) -> Self {
        table.identities().collect()
    }
}

/// Read-only view of the pool as seen by one worker.
pub struct Directory<'a, T: Transport + ?Sized> {
    transport: &'a T,
}

impl<'a, T: Transport + ?Sized> Directory<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Identity of the calling worker.
    pub fn own(&self) -> WorkerIdentity {
        self.transport.identity()
    }

    pub fn resolve_slot(&self, pid: Pid) -> Option<Slot> {
        self.transport.get_slot(pid)
    }

    pub fn resolve_pid(&self, slot: Slot) -> Option<Pid> {
        self.transport.get_pid(slot)
    }

    /// All live pids, in slot order.
    pub fn list_live_pids(&self) -> Vec<Pid> {
        self.transport.worker_pids()
    }

    /// All live pids except the caller's own.
    pub fn list_other_live_pids(&self) -> Vec<Pid> {
        let own = self.transport.identity().pid;
        self.transport
            .worker_pids()
            .into_iter()
            .filter(|pid| *pid != own)
            .collect()
    }
}
