//! Dispatch of received alerts to registered handlers.
//!
//! Each alert is looked up and, if a handler exists, invoked inside a guarded
//! scope: handler errors and panics are logged and contained, never
//! propagated to the worker loop or back to the sender.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, error, info_span};

use super::registry::{HandlerError, HandlerRegistry, ReceivedAlert};

/// What happened to one received alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran to completion.
    Delivered,
    /// No handler registered for the name.
    Dropped,
    /// The handler failed; the failure was logged.
    HandlerFailed,
}

/// Counters for one drain of the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
}

impl DispatchStats {
    pub fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Delivered => self.delivered += 1,
            DispatchOutcome::Dropped => self.dropped += 1,
            DispatchOutcome::HandlerFailed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.delivered + self.dropped + self.failed
    }
}

/// Marks a dispatch in progress for the lifetime of the guard.
///
/// The flag is cleared on every exit path, including unwinding out of a
/// handler.
pub struct DispatchGuard<'a> {
    active: &'a Cell<bool>,
}

impl<'a> DispatchGuard<'a> {
    /// Enter a dispatch scope, or `None` if one is already active.
    pub fn enter(active: &'a Cell<bool>) -> Option<Self> {
        if active.replace(true) {
            return None;
        }
        Some(Self { active })
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.active.set(false);
    }
}

/// Dispatch one received alert.
///
/// The registry borrow is released before the handler runs so handlers may
/// register or replace handlers, including their own.
pub fn dispatch(registry: &RefCell<HandlerRegistry>, received: &ReceivedAlert) -> DispatchOutcome {
    let handler = registry.borrow().lookup(received.name());
    let Some(handler) = handler else {
        debug!(name = %received.name(), "No handler for alert, dropping");
        return DispatchOutcome::Dropped;
    };

    let _span = info_span!(
        "alert",
        name = %received.name(),
        sender_pid = received.sender.pid,
        sender_slot = received.sender.slot,
    )
    .entered();

    match catch_unwind(AssertUnwindSafe(|| handler.handle(received))) {
        Ok(Ok(())) => DispatchOutcome::Delivered,
        Ok(Err(err)) => {
            report_failure(received, &err);
            DispatchOutcome::HandlerFailed
        }
        Err(panic) => {
            report_failure(received, &HandlerError::new(panic_message(panic.as_ref())));
            DispatchOutcome::HandlerFailed
        }
    }
}

fn report_failure(received: &ReceivedAlert, err: &HandlerError) {
    match &err.traceback {
        Some(traceback) => error!(
            name = %received.name(),
            sender_pid = received.sender.pid,
            sender_slot = received.sender.slot,
            error = %err,
            traceback = %traceback,
            "failed to run alert handler for '{}'",
            received.name()
        ),
        None => error!(
            name = %received.name(),
            sender_pid = received.sender.pid,
            sender_slot = received.sender.slot,
            error = %err,
            "failed to run alert handler for '{}'",
            received.name()
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked: unknown reason".to_string()
    }
}
