//! Shared utilities for integration tests.
//!
//! Provides recording handlers and log capture for asserting on dispatch.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use alertbus::bus::{handler_fn, AlertHandler, ChannelPool, ChannelTransport, ReceivedAlert};
use alertbus::{AlertBus, BusConfig};

/// Records every alert passed to handlers built from it.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Rc<RefCell<Vec<ReceivedAlert>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Rc<dyn AlertHandler> {
        let calls = Rc::clone(&self.calls);
        handler_fn(move |alert| {
            calls.borrow_mut().push(alert.clone());
            Ok(())
        })
    }

    pub fn calls(&self) -> Vec<ReceivedAlert> {
        self.calls.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.borrow().len()
    }
}

/// One bus per worker of a fresh channel pool.
pub fn channel_buses(workers: usize, config: BusConfig) -> Vec<AlertBus<ChannelTransport>> {
    ChannelPool::new(workers)
        .transports()
        .into_iter()
        .map(|transport| AlertBus::new(transport, config.clone()))
        .collect()
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` and return its result together with everything it logged.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (result, logs)
}
