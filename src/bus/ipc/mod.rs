//! Named-pipe transport for multi-process worker pools.
//!
//! Every pool slot owns a FIFO; any worker can write a frame into any other
//! worker's FIFO. The pid table lives next to the pipes and is rewritten by
//! the pool owner whenever membership changes.
//!
//! ```text
//!   worker 0 ──┐                       ┌──▶ worker-0.pipe ──▶ worker 0
//!   worker 1 ──┼── frame (≤ PIPE_BUF) ─┼──▶ worker-1.pipe ──▶ worker 1
//!   worker 2 ──┘                       └──▶ worker-2.pipe ──▶ worker 2
//!
//!                     workers.json: [{pid, slot}, ...]
//! ```
//!
//! Usage:
//! 1. The pool owner creates an `IpcPool`, which creates the pipes
//! 2. The owner records each worker's pid with `register_worker`
//! 3. Each worker builds an `IpcTransport` for its slot from the `PoolDescriptor`

mod frame;
mod pool;
mod transport;

pub use frame::{encode_frame, FrameError, FrameReader, MAX_FRAME_LEN};
pub use pool::{IpcPool, IpcPoolConfig, PoolDescriptor};
pub use transport::IpcTransport;

/// Default base path for pool pipes.
pub const DEFAULT_BASE_PATH: &str = crate::config::DEFAULT_POOL_PATH;

/// Pipe prefix for worker slots.
pub const WORKER_PIPE_PREFIX: &str = "worker-";

/// File name of the pid table.
pub const WORKER_TABLE_FILE: &str = "workers.json";
