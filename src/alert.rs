//! Alert values and delivery targets.
//!
//! An alert is a short name plus an opaque payload. The name is the dispatch
//! key on the receiving worker; the payload is delivered verbatim and never
//! interpreted by the bus.

use std::fmt;

use crate::bus::AlertError;

/// OS process id of a pool worker.
pub type Pid = i32;

/// Stable position of a worker within the pool.
pub type Slot = u32;

/// Longest accepted alert name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// A named, opaque message exchanged between workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    name: String,
    payload: Vec<u8>,
}

impl Alert {
    /// Build an alert, validating the name.
    ///
    /// Names must be non-empty and at most [`MAX_NAME_LEN`] bytes.
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<Self, AlertError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            payload: payload.into(),
        })
    }

    /// Build an alert with an empty payload.
    pub fn named(name: impl Into<String>) -> Result<Self, AlertError> {
        Self::new(name, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Split into name and payload.
    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.name, self.payload)
    }
}

fn validate_name(name: &str) -> Result<(), AlertError> {
    if name.is_empty() {
        return Err(AlertError::InvalidArgument(
            "alert name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(AlertError::InvalidArgument(format!(
            "alert name is {} bytes, limit is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Where an alert should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A specific worker process.
    Pid(Pid),
    /// Whichever worker currently occupies a pool slot.
    Slot(Slot),
    /// Every live worker; whether the sender is included is a bus setting.
    Broadcast,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Pid(pid) => write!(f, "pid {}", pid),
            Target::Slot(slot) => write!(f, "slot {}", slot),
            Target::Broadcast => write!(f, "all workers"),
        }
    }
}
