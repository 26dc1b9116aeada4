//! Per-process handler registry.
//!
//! One handler per alert name. Registering a name again silently replaces the
//! previous handler. The registry never leaves the process that owns it.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::alert::Alert;
use crate::directory::WorkerIdentity;

/// An alert as seen by the receiving worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAlert {
    /// Worker that sent the alert.
    pub sender: WorkerIdentity,
    pub alert: Alert,
}

impl ReceivedAlert {
    pub fn new(sender: WorkerIdentity, alert: Alert) -> Self {
        Self { sender, alert }
    }

    pub fn name(&self) -> &str {
        self.alert.name()
    }

    pub fn payload(&self) -> &[u8] {
        self.alert.payload()
    }
}

/// Failure reported by a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    /// Execution trace, when the handler's runtime can produce one.
    pub traceback: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Something that can receive alerts of one name.
///
/// Implemented for plain closures; the Lua bridge provides another adapter.
pub trait AlertHandler {
    fn handle(&self, alert: &ReceivedAlert) -> Result<(), HandlerError>;
}

impl<F> AlertHandler for F
where
    F: Fn(&ReceivedAlert) -> Result<(), HandlerError>,
{
    fn handle(&self, alert: &ReceivedAlert) -> Result<(), HandlerError> {
        self(alert)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Rc<dyn AlertHandler>
where
    F: Fn(&ReceivedAlert) -> Result<(), HandlerError> + 'static,
{
    Rc::new(f)
}

/// Mapping from alert name to its active handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Rc<dyn AlertHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Rc<dyn AlertHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(name = %name, "Replaced alert handler");
        } else {
            debug!(name = %name, "Registered alert handler");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<dyn AlertHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Drop every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn received(name: &str) -> ReceivedAlert {
        ReceivedAlert::new(WorkerIdentity::new(100, 0), Alert::named(name).unwrap())
    }

    #[test]
    fn test_lookup_missing() {
        let registry = HandlerRegistry::new();
        assert!(registry.lookup("nothing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_replaces_previous() {
        let first = Rc::new(Cell::new(0));
        let second = Rc::new(Cell::new(0));

        let mut registry = HandlerRegistry::new();
        let counter = Rc::clone(&first);
        registry.register(
            "reload",
            handler_fn(move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            }),
        );
        let counter = Rc::clone(&second);
        registry.register(
            "reload",
            handler_fn(move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            }),
        );

        assert_eq!(registry.len(), 1);
        let handler = registry.lookup("reload").unwrap();
        handler.handle(&received("reload")).unwrap();

        assert_eq!(first.get(), 0);
        assert_eq!(second.get(), 1);
    }

    #[test]
    fn test_clear_and_names() {
        let mut registry = HandlerRegistry::new();
        registry.register("b", handler_fn(|_| Ok(())));
        registry.register("a", handler_fn(|_| Ok(())));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::new("bad input").with_traceback("stack traceback:\n\t[C]: in ?");
        assert_eq!(err.to_string(), "bad input");
        assert!(err.traceback.unwrap().starts_with("stack traceback"));
    }
}
