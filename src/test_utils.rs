//! Test utilities.
//!
//! Recording handlers and a log capture helper for asserting on what the
//! dispatch engine reports.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::bus::{AlertHandler, HandlerError, ReceivedAlert};

/// Handler that records every alert it receives.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    calls: Rc<RefCell<Vec<ReceivedAlert>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ReceivedAlert> {
        self.calls.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn into_handler(self) -> Rc<dyn AlertHandler> {
        Rc::new(self)
    }
}

impl AlertHandler for RecordingHandler {
    fn handle(&self, alert: &ReceivedAlert) -> Result<(), HandlerError> {
        self.calls.borrow_mut().push(alert.clone());
        Ok(())
    }
}

/// Shared buffer usable as a tracing writer.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a subscriber that records all log output as plain text.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}
