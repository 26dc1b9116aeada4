//! Alertbus - named alerts between the workers of a process pool
//!
//! Workers exchange small named messages addressed by pid, by pool slot or
//! to everyone. Each worker owns an [`bus::AlertBus`] that validates and
//! addresses outgoing alerts and dispatches incoming ones to handlers, which
//! are usually Lua functions registered through [`script::ScriptHost`].

pub mod alert;
pub mod bus;
pub mod config;
pub mod directory;
#[cfg(unix)]
pub mod process;
#[cfg(feature = "lua")]
pub mod script;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

pub use alert::{Alert, Pid, Slot, Target};
pub use bus::{AlertBus, AlertError, BroadcastScope, BusConfig, Transport, TransportError};
pub use directory::{Directory, WorkerIdentity, WorkerTable};
