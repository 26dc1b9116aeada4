//! Alert bus for inter-worker delivery.
//!
//! This module contains:
//! - `Transport` trait: point-to-point and broadcast delivery between workers
//! - `AlertBus`: the per-worker handle that addresses alerts, keeps the
//!   last-error slot and dispatches received alerts to handlers
//! - Bus configuration types
//! - Implementations: in-memory channel pool, named-pipe IPC

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::alert::{Alert, Pid, Slot, Target};
use crate::directory::{Directory, WorkerIdentity};

// Implementation modules
pub mod channel;
pub mod dispatch;
#[cfg(unix)]
pub mod ipc;
pub mod registry;

// Re-exports
pub use channel::{ChannelPool, ChannelTransport};
pub use dispatch::{DispatchOutcome, DispatchStats};
pub use registry::{handler_fn, AlertHandler, HandlerError, HandlerRegistry, ReceivedAlert};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, AlertError>;

/// Errors reported to the sender of an alert.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlertError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Errors raised by a transport primitive.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no live worker at {0}")]
    NoSuchWorker(String),

    #[error("mailbox of {0} is full")]
    Full(String),

    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("transport closed: {0}")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for AlertError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NoSuchWorker(_) => AlertError::UnknownTarget(err.to_string()),
            other => AlertError::Transport(other.to_string()),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Whether a broadcast also reaches the sending worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastScope {
    /// Every live worker, the sender included.
    #[default]
    IncludeSelf,
    /// Every live worker except the sender.
    ExcludeSelf,
}

impl BroadcastScope {
    /// Whether a broadcast from `sender` should be delivered to `pid`.
    pub fn reaches(&self, sender: Pid, pid: Pid) -> bool {
        match self {
            BroadcastScope::IncludeSelf => true,
            BroadcastScope::ExcludeSelf => sender != pid,
        }
    }
}

/// Delivery primitive between the workers of one pool.
///
/// Sends are non-blocking: a full mailbox fails immediately. `receive` drains
/// whatever has arrived for this worker without waiting.
pub trait Transport {
    /// Identity of the worker owning this transport.
    fn identity(&self) -> WorkerIdentity;

    fn send_to_pid(&self, pid: Pid, alert: &Alert) -> std::result::Result<(), TransportError>;

    fn send_to_slot(&self, slot: Slot, alert: &Alert) -> std::result::Result<(), TransportError>;

    /// Send to every live worker selected by `scope`.
    ///
    /// Every target is attempted; the first failure is returned.
    fn broadcast(
        &self,
        alert: &Alert,
        scope: BroadcastScope,
    ) -> std::result::Result<(), TransportError>;

    fn get_slot(&self, pid: Pid) -> Option<Slot>;

    fn get_pid(&self, slot: Slot) -> Option<Pid>;

    /// Live worker pids in slot order.
    fn worker_pids(&self) -> Vec<Pid>;

    /// Take every alert that has arrived for this worker.
    fn receive(&self) -> std::result::Result<Vec<ReceivedAlert>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn identity(&self) -> WorkerIdentity {
        (**self).identity()
    }

    fn send_to_pid(&self, pid: Pid, alert: &Alert) -> std::result::Result<(), TransportError> {
        (**self).send_to_pid(pid, alert)
    }

    fn send_to_slot(&self, slot: Slot, alert: &Alert) -> std::result::Result<(), TransportError> {
        (**self).send_to_slot(slot, alert)
    }

    fn broadcast(
        &self,
        alert: &Alert,
        scope: BroadcastScope,
    ) -> std::result::Result<(), TransportError> {
        (**self).broadcast(alert, scope)
    }

    fn get_slot(&self, pid: Pid) -> Option<Slot> {
        (**self).get_slot(pid)
    }

    fn get_pid(&self, slot: Slot) -> Option<Pid> {
        (**self).get_pid(slot)
    }

    fn worker_pids(&self) -> Vec<Pid> {
        (**self).worker_pids()
    }

    fn receive(&self) -> std::result::Result<Vec<ReceivedAlert>, TransportError> {
        (**self).receive()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Bus behaviour settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Whether broadcasts reach the sending worker.
    pub broadcast: BroadcastScope,
}

// ============================================================================
// Bus handle
// ============================================================================

/// Per-worker alert bus.
///
/// Constructed once during worker initialisation and dropped at worker
/// shutdown, which also releases the transport. The bus is single-threaded:
/// handlers and sends never run concurrently within a worker.
pub struct AlertBus<T: Transport> {
    transport: T,
    config: BusConfig,
    registry: RefCell<HandlerRegistry>,
    last_error: RefCell<String>,
    dispatching: Cell<bool>,
}

impl<T: Transport> AlertBus<T> {
    pub fn new(transport: T, config: BusConfig) -> Self {
        let identity = transport.identity();
        info!(
            pid = identity.pid,
            slot = identity.slot,
            broadcast = ?config.broadcast,
            "Alert bus initialized"
        );
        Self {
            transport,
            config,
            registry: RefCell::new(HandlerRegistry::new()),
            last_error: RefCell::new(String::new()),
            dispatching: Cell::new(false),
        }
    }

    /// Wrap in `Rc` for sharing with script bindings.
    pub fn shared(self) -> Rc<Self> {
        Rc::new(self)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Identity of this worker.
    pub fn identity(&self) -> WorkerIdentity {
        self.transport.identity()
    }

    /// Directory view of the pool.
    pub fn directory(&self) -> Directory<'_, T> {
        Directory::new(&self.transport)
    }

    // ------------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------------

    /// Send an alert to a target.
    ///
    /// Clears the last-error slot first; on failure the slot holds the reason.
    pub fn send(&self, target: Target, alert: &Alert) -> Result<()> {
        self.last_error.borrow_mut().clear();

        let result = self.deliver(target, alert);
        match &result {
            Ok(()) => debug!(name = %alert.name(), %target, "Alert sent"),
            Err(err) => {
                warn!(name = %alert.name(), %target, error = %err, "Alert send failed");
                *self.last_error.borrow_mut() = err.to_string();
            }
        }
        result
    }

    /// Validate `name` and `payload`, then send to `target`.
    ///
    /// Validation failures are recorded in the last-error slot like any other
    /// send failure.
    pub fn send_named(&self, target: Target, name: &str, payload: &[u8]) -> Result<()> {
        match Alert::new(name, payload) {
            Ok(alert) => self.send(target, &alert),
            Err(err) => self.reject(err),
        }
    }

    /// Fail a send that was refused before an alert could be built, recording
    /// the reason in the last-error slot.
    pub fn reject(&self, err: AlertError) -> Result<()> {
        debug!(error = %err, "Alert rejected");
        *self.last_error.borrow_mut() = err.to_string();
        Err(err)
    }

    pub fn send_by_pid(&self, pid: Pid, name: &str, payload: &[u8]) -> Result<()> {
        self.send_named(Target::Pid(pid), name, payload)
    }

    pub fn send_by_slot(&self, slot: Slot, name: &str, payload: &[u8]) -> Result<()> {
        self.send_named(Target::Slot(slot), name, payload)
    }

    pub fn broadcast(&self, name: &str, payload: &[u8]) -> Result<()> {
        self.send_named(Target::Broadcast, name, payload)
    }

    fn deliver(&self, target: Target, alert: &Alert) -> Result<()> {
        match target {
            Target::Pid(pid) => Ok(self.transport.send_to_pid(pid, alert)?),
            Target::Slot(slot) => {
                if self.transport.get_pid(slot).is_none() {
                    return Err(AlertError::UnknownTarget(format!(
                        "no worker in slot {}",
                        slot
                    )));
                }
                Ok(self.transport.send_to_slot(slot, alert)?)
            }
            Target::Broadcast => Ok(self.transport.broadcast(alert, self.config.broadcast)?),
        }
    }

    /// Reason for the most recent failed send, empty after a success.
    pub fn last_error(&self) -> String {
        self.last_error.borrow().clone()
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    /// Register `handler` for `name`, replacing any previous handler.
    pub fn register(&self, name: impl Into<String>, handler: Rc<dyn AlertHandler>) {
        self.registry.borrow_mut().register(name, handler);
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<dyn AlertHandler>> {
        self.registry.borrow().lookup(name)
    }

    /// Forget every handler, e.g. when the scripting environment restarts.
    pub fn clear_handlers(&self) {
        self.registry.borrow_mut().clear();
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.registry.borrow().names()
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Dispatch one received alert to its handler.
    pub fn dispatch(&self, received: &ReceivedAlert) -> DispatchOutcome {
        dispatch::dispatch(&self.registry, received)
    }

    /// Drain the transport and dispatch every pending alert in arrival order.
    ///
    /// Alerts sent by handlers during this drain are left for the next poll.
    /// A call made from inside a handler returns immediately with empty stats.
    pub fn poll(&self) -> std::result::Result<DispatchStats, TransportError> {
        let mut stats = DispatchStats::default();
        let Some(_guard) = dispatch::DispatchGuard::enter(&self.dispatching) else {
            debug!("Poll requested during dispatch, deferring");
            return Ok(stats);
        };

        for received in self.transport.receive()? {
            stats.record(self.dispatch(&received));
        }

        if stats.total() > 0 {
            debug!(
                delivered = stats.delivered,
                dropped = stats.dropped,
                failed = stats.failed,
                "Dispatched alerts"
            );
        }
        Ok(stats)
    }
}

impl<T: Transport> Drop for AlertBus<T> {
    fn drop(&mut self) {
        let identity = self.transport.identity();
        info!(pid = identity.pid, slot = identity.slot, "Alert bus shut down");
    }
}
