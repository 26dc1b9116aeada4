//! Wire frames for the pipe transport.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! u32 length of the rest | i32 sender pid | u32 sender slot | u16 name length | name | payload
//! ```
//!
//! A whole frame never exceeds `PIPE_BUF`, so each one is written with a
//! single atomic `write` and frames from concurrent writers never interleave.

use nix::libc;

use crate::alert::Alert;
use crate::bus::{ReceivedAlert, TransportError};
use crate::directory::WorkerIdentity;

/// Largest frame, header included.
pub const MAX_FRAME_LEN: usize = libc::PIPE_BUF;

const LEN_PREFIX: usize = 4;
const HEADER_LEN: usize = LEN_PREFIX + 4 + 4 + 2;

/// Errors decoding a frame stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds limit")]
    TooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Encode an alert from `sender` into one frame.
pub fn encode_frame(sender: WorkerIdentity, alert: &Alert) -> Result<Vec<u8>, TransportError> {
    let name = alert.name().as_bytes();
    let len = HEADER_LEN + name.len() + alert.payload().len();
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len,
            limit: MAX_FRAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&((len - LEN_PREFIX) as u32).to_be_bytes());
    buf.extend_from_slice(&sender.pid.to_be_bytes());
    buf.extend_from_slice(&sender.slot.to_be_bytes());
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(alert.payload());
    Ok(buf)
}

/// Reassembles frames from bytes read off a pipe.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discard everything buffered. Used after a decode error, since the
    /// stream cannot be resynchronised.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<ReceivedAlert>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes(read_array(&self.buf, 0)) as usize;
        let total = LEN_PREFIX + body_len;
        if total > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(total));
        }
        if total < HEADER_LEN {
            return Err(FrameError::Malformed(format!(
                "frame length {} shorter than header",
                total
            )));
        }
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        decode_body(&frame).map(Some)
    }
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

fn decode_body(frame: &[u8]) -> Result<ReceivedAlert, FrameError> {
    let pid = i32::from_be_bytes(read_array(frame, 4));
    let slot = u32::from_be_bytes(read_array(frame, 8));
    let name_len = u16::from_be_bytes(read_array(frame, 12)) as usize;

    let name_end = HEADER_LEN + name_len;
    if name_end > frame.len() {
        return Err(FrameError::Malformed(format!(
            "name length {} overruns frame",
            name_len
        )));
    }
    let name = std::str::from_utf8(&frame[HEADER_LEN..name_end])
        .map_err(|e| FrameError::Malformed(format!("alert name is not UTF-8: {}", e)))?;
    let alert = Alert::new(name, &frame[name_end..])
        .map_err(|e| FrameError::Malformed(e.to_string()))?;

    Ok(ReceivedAlert::new(WorkerIdentity::new(pid, slot), alert))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> WorkerIdentity {
        WorkerIdentity::new(31337, 2)
    }

    #[test]
    fn test_frame_layout() {
        let alert = Alert::new("hi", b"!".to_vec()).unwrap();
        let frame = encode_frame(sender(), &alert).unwrap();

        assert_eq!(frame.len(), HEADER_LEN + 3);
        assert_eq!(&frame[..4], &((frame.len() - 4) as u32).to_be_bytes());
        assert_eq!(&frame[4..8], &31337i32.to_be_bytes());
        assert_eq!(&frame[8..12], &2u32.to_be_bytes());
        assert_eq!(&frame[12..14], &2u16.to_be_bytes());
        assert_eq!(&frame[14..], b"hi!");
    }

    #[test]
    fn test_oversized_alert_rejected() {
        let alert = Alert::new("big", vec![0u8; MAX_FRAME_LEN]).unwrap();
        let err = encode_frame(sender(), &alert).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_reader_handles_split_and_batched_frames() {
        let first = encode_frame(sender(), &Alert::new("a", b"1".to_vec()).unwrap()).unwrap();
        let second = encode_frame(sender(), &Alert::named("b").unwrap()).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut reader = FrameReader::new();
        reader.push(&stream[..5]);
        assert!(reader.next_frame().unwrap().is_none());

        reader.push(&stream[5..]);
        let a = reader.next_frame().unwrap().unwrap();
        let b = reader.next_frame().unwrap().unwrap();
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.buffered(), 0);

        assert_eq!(a.sender, sender());
        assert_eq!(a.name(), "a");
        assert_eq!(a.payload(), b"1");
        assert_eq!(b.name(), "b");
        assert!(b.payload().is_empty());
    }

    #[test]
    fn test_reader_rejects_bad_length() {
        let mut reader = FrameReader::new();
        reader.push(&(u32::MAX).to_be_bytes());
        assert!(matches!(reader.next_frame(), Err(FrameError::TooLarge(_))));

        reader.reset();
        reader.push(&2u32.to_be_bytes());
        reader.push(&[0, 0]);
        assert!(matches!(reader.next_frame(), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_reader_rejects_empty_name() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((HEADER_LEN - 4) as u32).to_be_bytes());
        frame.extend_from_slice(&1i32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());

        let mut reader = FrameReader::new();
        reader.push(&frame);
        assert!(matches!(reader.next_frame(), Err(FrameError::Malformed(_))));
    }
}
