//! Worker-side pipe transport.
//!
//! Writers open the target FIFO non-blocking for each frame. The reader keeps
//! its own FIFO open for reading and for writing, so it never sees EOF and
//! can alert itself.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::libc;
use nix::unistd::getpid;
use tracing::{debug, error, info};

use super::frame::{encode_frame, FrameReader, MAX_FRAME_LEN};
use super::pool::PoolDescriptor;
use crate::alert::{Alert, Pid, Slot};
use crate::bus::{BroadcastScope, ReceivedAlert, Transport, TransportError};
use crate::directory::WorkerIdentity;

/// Pipe transport for one worker.
pub struct IpcTransport {
    descriptor: PoolDescriptor,
    identity: WorkerIdentity,
    reader: File,
    /// Write end of our own pipe; keeps the reader from seeing EOF.
    _keepalive: File,
    frames: RefCell<FrameReader>,
}

impl IpcTransport {
    /// Attach the calling process to `slot` of the pool.
    pub fn init_for_worker(descriptor: PoolDescriptor, slot: Slot) -> Result<Self, TransportError> {
        Self::with_pid(descriptor, slot, getpid().as_raw())
    }

    /// Attach to `slot` under an explicit pid.
    pub fn with_pid(
        descriptor: PoolDescriptor,
        slot: Slot,
        pid: Pid,
    ) -> Result<Self, TransportError> {
        let pipe_path = descriptor.pipe_path(slot);
        let reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&pipe_path)?;
        let keepalive = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&pipe_path)?;

        info!(pid, slot, pipe = %pipe_path.display(), "IPC transport attached");

        Ok(Self {
            descriptor,
            identity: WorkerIdentity::new(pid, slot),
            reader,
            _keepalive: keepalive,
            frames: RefCell::new(FrameReader::new()),
        })
    }

    /// File descriptor that becomes readable when alerts arrive.
    pub fn reader_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    fn write_frame(&self, slot: Slot, frame: &[u8]) -> Result<(), TransportError> {
        let pipe_path = self.descriptor.pipe_path(slot);
        let mut file = match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&pipe_path)
        {
            Ok(file) => file,
            // ENXIO = nobody has the pipe open for reading
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                return Err(TransportError::NoSuchWorker(format!(
                    "slot {} (not listening)",
                    slot
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransportError::NoSuchWorker(format!("slot {}", slot)))
            }
            Err(e) => return Err(e.into()),
        };

        match file.write(frame) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(n) => Err(TransportError::Io(io::Error::other(format!(
                "short write of {} of {} bytes to slot {}",
                n,
                frame.len(),
                slot
            )))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(TransportError::Full(format!("slot {}", slot)))
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(TransportError::NoSuchWorker(
                format!("slot {} (reader gone)", slot),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl Transport for IpcTransport {
    fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    fn send_to_pid(&self, pid: Pid, alert: &Alert) -> Result<(), TransportError> {
        let slot = self
            .descriptor
            .load_table()
            .slot_of(pid)
            .ok_or_else(|| TransportError::NoSuchWorker(format!("pid {}", pid)))?;
        let frame = encode_frame(self.identity, alert)?;
        self.write_frame(slot, &frame)
    }

    fn send_to_slot(&self, slot: Slot, alert: &Alert) -> Result<(), TransportError> {
        if self.descriptor.load_table().pid_of(slot).is_none() {
            return Err(TransportError::NoSuchWorker(format!("slot {}", slot)));
        }
        let frame = encode_frame(self.identity, alert)?;
        self.write_frame(slot, &frame)
    }

    fn broadcast(&self, alert: &Alert, scope: BroadcastScope) -> Result<(), TransportError> {
        let frame = encode_frame(self.identity, alert)?;
        let table = self.descriptor.load_table();

        let mut failed = 0;
        let mut first_error = None;
        for worker in table.identities() {
            if !scope.reaches(self.identity.pid, worker.pid) {
                continue;
            }
            if let Err(e) = self.write_frame(worker.slot, &frame) {
                debug!(slot = worker.slot, error = %e, "Broadcast delivery failed");
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                debug!(failed, name = %alert.name(), "Broadcast incomplete");
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn get_slot(&self, pid: Pid) -> Option<Slot> {
        self.descriptor.load_table().slot_of(pid)
    }

    fn get_pid(&self, slot: Slot) -> Option<Pid> {
        self.descriptor.load_table().pid_of(slot)
    }

    fn worker_pids(&self) -> Vec<Pid> {
        self.descriptor.load_table().pids()
    }

    fn receive(&self) -> Result<Vec<ReceivedAlert>, TransportError> {
        let mut frames = self.frames.borrow_mut();
        let mut buf = [0u8; MAX_FRAME_LEN];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => frames.push(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut received = Vec::new();
        loop {
            match frames.next_frame() {
                Ok(Some(alert)) => received.push(alert),
                Ok(None) => break,
                Err(e) => {
                    error!(
                        error = %e,
                        discarded = frames.buffered(),
                        "Corrupt frame on worker pipe"
                    );
                    frames.reset();
                    break;
                }
            }
        }
        Ok(received)
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        debug!(
            pid = self.identity.pid,
            slot = self.identity.slot,
            "IPC transport detached"
        );
    }
}
