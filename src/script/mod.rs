//! Lua bridge for the alert bus.
//!
//! Exposes the bus to worker scripts as the `alertbus` module and adapts Lua
//! functions to [`AlertHandler`]. Scripts get the module either through
//! `require("alertbus")` or as the first argument of the init file:
//!
//! ```lua
//! local ipc = ...
//! ipc.receive("reload", function(sender_pid, sender_slot, name, payload)
//!     -- ...
//! end)
//! ipc.broadcast("reload", "config-v2")
//! ```

use std::cell::Cell;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, Lua, LuaOptions, StdLib, Table, Value, VmState};
use tracing::{debug, error, info};

use crate::alert::{Pid, Slot};
use crate::bus::{AlertBus, AlertError, AlertHandler, HandlerError, ReceivedAlert, Transport};
use crate::config::ScriptConfig;

/// Name under which the module is registered in `package.loaded`.
pub const MODULE_NAME: &str = "alertbus";

/// Reason returned to scripts once the bus has been torn down.
pub const BUS_CLOSED: &str = "alert bus is closed";

/// Instructions between budget checks.
const BUDGET_CHECK_INTERVAL: u32 = 1000;

/// Runs a handler under `xpcall`, turning any error into a message with a
/// traceback attached.
const TRAMPOLINE: &str = r#"
local describe = ...
local xpcall, traceback = xpcall, debug.traceback
local function on_error(err)
    return traceback(describe(err), 2)
end
return function(handler, ...)
    return xpcall(handler, on_error, ...)
end
"#;

/// Errors from the scripting environment.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to read script '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lua error: {0}")]
    Lua(String),
}

impl From<mlua::Error> for ScriptError {
    fn from(e: mlua::Error) -> Self {
        ScriptError::Lua(e.to_string())
    }
}

/// Lua state bound to one worker's bus.
pub struct ScriptHost<T: Transport + 'static> {
    lua: Lua,
    module: Table,
    bus: Weak<AlertBus<T>>,
}

impl<T: Transport + 'static> ScriptHost<T> {
    /// Create a fresh Lua state for `bus`.
    ///
    /// Any handlers left from a previous state are forgotten.
    pub fn new(bus: &Rc<AlertBus<T>>, config: &ScriptConfig) -> Result<Self, ScriptError> {
        // SAFETY: the debug library is only needed for `debug.traceback`; no
        // userdata from this crate relies on its metatable being hidden.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE | StdLib::DEBUG, LuaOptions::new()) };

        bus.clear_handlers();

        let trampoline = build_trampoline(&lua)?;
        let module = build_module(&lua, Rc::downgrade(bus), trampoline, config.handler_budget())?;

        let package: Table = lua.globals().get("package")?;
        let loaded: Table = package.get("loaded")?;
        loaded.set(MODULE_NAME, module.clone())?;

        let identity = bus.identity();
        info!(
            pid = identity.pid,
            slot = identity.slot,
            budget_ms = ?config.handler_budget_ms,
            "Script host initialized"
        );

        Ok(Self {
            lua,
            module,
            bus: Rc::downgrade(bus),
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// The `alertbus` module table.
    pub fn module(&self) -> &Table {
        &self.module
    }

    /// Whether the bus this host was built for is still alive.
    pub fn is_attached(&self) -> bool {
        self.bus.strong_count() > 0
    }

    /// Run a worker init script once, passing the module as its first argument.
    pub fn run_init_file(&self, path: &Path) -> Result<(), ScriptError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to read init script");
            ScriptError::Io {
                path: path.display().to_string(),
                source: e,
            }
        })?;
        self.run_chunk(&path.display().to_string(), &source)
    }

    /// Run a chunk of Lua source with the module as its first argument.
    pub fn run_chunk(&self, name: &str, source: &str) -> Result<(), ScriptError> {
        let result = self
            .lua
            .load(source)
            .set_name(format!("@{}", name))
            .into_function()
            .and_then(|chunk| chunk.call::<()>(self.module.clone()));

        match result {
            Ok(()) => {
                debug!(script = %name, "Ran script");
                Ok(())
            }
            Err(e) => {
                error!(script = %name, error = %e, "failed to run script");
                Err(e.into())
            }
        }
    }
}

fn build_trampoline(lua: &Lua) -> mlua::Result<Function> {
    let describe = lua.create_function(|_, err: Value| {
        Ok(match err {
            Value::String(s) => s.to_string_lossy().to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Error(e) => e.to_string(),
            _ => "unknown reason".to_string(),
        })
    })?;
    lua.load(TRAMPOLINE)
        .set_name("=alertbus.dispatch")
        .call::<Function>(describe)
}

type SendReply = (Option<bool>, Option<String>);

fn send_reply<T: Transport>(bus: &AlertBus<T>, result: crate::bus::Result<()>) -> SendReply {
    match result {
        Ok(()) => (Some(true), None),
        Err(_) => (None, Some(bus.last_error())),
    }
}

fn closed() -> SendReply {
    (None, Some(BUS_CLOSED.to_string()))
}

fn payload_bytes(payload: &Option<mlua::String>) -> Vec<u8> {
    payload
        .as_ref()
        .map(|p| p.as_bytes().to_vec())
        .unwrap_or_default()
}

/// Alert names must be UTF-8; anything else is refused like any other invalid
/// name rather than raised as a Lua error.
fn alert_name(name: &mlua::String) -> crate::bus::Result<String> {
    name.to_str().map(|name| name.to_string()).map_err(|_| {
        AlertError::InvalidArgument(format!(
            "alert name {:?} is not valid UTF-8",
            name.to_string_lossy()
        ))
    })
}

fn build_module<T: Transport + 'static>(
    lua: &Lua,
    bus: Weak<AlertBus<T>>,
    trampoline: Function,
    budget: Option<Duration>,
) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let weak = bus.clone();
    module.set(
        "send_by_pid",
        lua.create_function(
            move |_, (pid, name, payload): (Pid, mlua::String, Option<mlua::String>)| {
                let Some(bus) = weak.upgrade() else {
                    return Ok(closed());
                };
                let result = match alert_name(&name) {
                    Ok(name) => bus.send_by_pid(pid, &name, &payload_bytes(&payload)),
                    Err(err) => bus.reject(err),
                };
                Ok(send_reply(&bus, result))
            },
        )?,
    )?;

    let weak = bus.clone();
    module.set(
        "send_by_slot",
        lua.create_function(
            move |_, (slot, name, payload): (Slot, mlua::String, Option<mlua::String>)| {
                let Some(bus) = weak.upgrade() else {
                    return Ok(closed());
                };
                let result = match alert_name(&name) {
                    Ok(name) => bus.send_by_slot(slot, &name, &payload_bytes(&payload)),
                    Err(err) => bus.reject(err),
                };
                Ok(send_reply(&bus, result))
            },
        )?,
    )?;

    let weak = bus.clone();
    module.set(
        "broadcast",
        lua.create_function(move |_, (name, payload): (mlua::String, Option<mlua::String>)| {
            let Some(bus) = weak.upgrade() else {
                return Ok(closed());
            };
            let result = match alert_name(&name) {
                Ok(name) => bus.broadcast(&name, &payload_bytes(&payload)),
                Err(err) => bus.reject(err),
            };
            Ok(send_reply(&bus, result))
        })?,
    )?;

    let weak = bus.clone();
    module.set(
        "get_worker_slot",
        lua.create_function(move |_, pid: Pid| {
            let Some(bus) = weak.upgrade() else {
                return Ok((None, Some(BUS_CLOSED)));
            };
            Ok(match bus.directory().resolve_slot(pid) {
                Some(slot) => (Some(slot), None),
                None => (None, Some("no slot")),
            })
        })?,
    )?;

    let weak = bus.clone();
    module.set(
        "get_worker_pid",
        lua.create_function(move |_, slot: Slot| {
            let Some(bus) = weak.upgrade() else {
                return Ok((None, Some(BUS_CLOSED)));
            };
            Ok(match bus.directory().resolve_pid(slot) {
                Some(pid) => (Some(pid), None),
                None => (None, Some("no pid")),
            })
        })?,
    )?;

    let weak = bus.clone();
    module.set(
        "get_worker_pids",
        lua.create_function(move |_, ()| {
            Ok(weak
                .upgrade()
                .map(|bus| bus.directory().list_live_pids())
                .unwrap_or_default())
        })?,
    )?;

    let weak = bus.clone();
    module.set(
        "get_other_worker_pids",
        lua.create_function(move |_, ()| {
            Ok(weak
                .upgrade()
                .map(|bus| bus.directory().list_other_live_pids())
                .unwrap_or_default())
        })?,
    )?;

    let weak = bus.clone();
    module.set(
        "get_last_error",
        lua.create_function(move |_, ()| {
            Ok(weak
                .upgrade()
                .map(|bus| bus.last_error())
                .unwrap_or_else(|| BUS_CLOSED.to_string()))
        })?,
    )?;

    let weak = bus;
    module.set(
        "receive",
        lua.create_function(move |lua, (name, function): (mlua::String, Function)| {
            let Some(bus) = weak.upgrade() else {
                return Err(mlua::Error::RuntimeError(BUS_CLOSED.to_string()));
            };
            let name = alert_name(&name).map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            if name.is_empty() {
                return Err(mlua::Error::RuntimeError(
                    "alert name must not be empty".to_string(),
                ));
            }
            let handler = LuaHandler {
                lua: lua.clone(),
                function,
                trampoline: trampoline.clone(),
                budget,
            };
            bus.register(name, Rc::new(handler));
            Ok(())
        })?,
    )?;

    Ok(module)
}

// ============================================================================
// Handler adapter
// ============================================================================

/// A Lua function registered as an alert handler.
struct LuaHandler {
    lua: Lua,
    function: Function,
    trampoline: Function,
    budget: Option<Duration>,
}

impl AlertHandler for LuaHandler {
    fn handle(&self, alert: &ReceivedAlert) -> Result<(), HandlerError> {
        let budget = self
            .budget
            .map(|budget| BudgetGuard::install(&self.lua, budget));

        let outcome = self.invoke(alert);
        match budget {
            Some(guard) if guard.exceeded() => Err(guard.failure(outcome.err())),
            _ => outcome,
        }
    }
}

impl LuaHandler {
    fn invoke(&self, alert: &ReceivedAlert) -> Result<(), HandlerError> {
        let payload = self
            .lua
            .create_string(alert.payload())
            .map_err(|e| HandlerError::new(e.to_string()))?;
        let (ok, err): (bool, Value) = self
            .trampoline
            .call((
                self.function.clone(),
                alert.sender.pid,
                alert.sender.slot,
                alert.name(),
                payload,
            ))
            .map_err(|e| HandlerError::new(e.to_string()))?;

        if ok {
            return Ok(());
        }
        let message = match err {
            Value::String(s) => s.to_string_lossy().to_string(),
            _ => "unknown reason".to_string(),
        };
        Err(split_traceback(&message))
    }
}

fn split_traceback(message: &str) -> HandlerError {
    match message.split_once("\nstack traceback:") {
        Some((reason, trace)) => {
            HandlerError::new(reason).with_traceback(format!("stack traceback:{}", trace))
        }
        None => HandlerError::new(message),
    }
}

/// Aborts the running handler once it exceeds its time budget.
///
/// Past the budget every check raises again, and calls are checked as well
/// as instruction counts, so a handler cannot keep running by catching the
/// error with `pcall`. The hook is removed when the guard drops.
struct BudgetGuard<'a> {
    lua: &'a Lua,
    budget: Duration,
    exceeded: Rc<Cell<bool>>,
}

impl<'a> BudgetGuard<'a> {
    fn install(lua: &'a Lua, budget: Duration) -> Self {
        let started = Instant::now();
        let exceeded = Rc::new(Cell::new(false));
        let flag = Rc::clone(&exceeded);
        lua.set_hook(
            HookTriggers::new()
                .on_calls()
                .every_nth_instruction(BUDGET_CHECK_INTERVAL),
            move |_, _| {
                if started.elapsed() <= budget {
                    return Ok(VmState::Continue);
                }
                flag.set(true);
                Err(mlua::Error::RuntimeError(budget_message(budget)))
            },
        );
        Self {
            lua,
            budget,
            exceeded,
        }
    }

    fn exceeded(&self) -> bool {
        self.exceeded.get()
    }

    /// Failure for a handler that ran out of time. The handler's own error,
    /// if any, only contributes its traceback.
    fn failure(&self, err: Option<HandlerError>) -> HandlerError {
        let failure = HandlerError::new(budget_message(self.budget));
        match err.and_then(|e| e.traceback) {
            Some(traceback) => failure.with_traceback(traceback),
            None => failure,
        }
    }
}

impl Drop for BudgetGuard<'_> {
    fn drop(&mut self) {
        self.lua.remove_hook();
    }
}

fn budget_message(budget: Duration) -> String {
    format!("handler exceeded its budget of {} ms", budget.as_millis())
}
