//! Per-connection receive buffer with a hard size cap.
//!
//! Bytes accumulate until a complete frame can be decoded; partial frames
//! stay buffered. A connection that exceeds the cap without producing a
//! frame is beyond saving and must be closed before anything else is
//! dispatched.

use crate::wire::{decode_request, FrameError, Request};
use thiserror::Error;

/// Floor for the configurable cap. Below this, legitimate clients with a
/// single large record could never complete a frame.
pub const MIN_BUFFER_CAP: usize = 1 << 20;

/// Default cap when the configuration does not say otherwise.
pub const DEFAULT_BUFFER_CAP: usize = 4 << 20;

#[derive(Error, Debug)]
#[error("receive buffer exceeded {cap} bytes")]
pub struct BufferOverflow {
    pub cap: usize,
}

pub struct FrameBuffer {
    buf: Vec<u8>,
    cap: usize,
}

impl FrameBuffer {
    pub fn new(cap: usize) -> FrameBuffer {
        FrameBuffer {
            buf: Vec::new(),
            cap: cap.max(MIN_BUFFER_CAP),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a chunk read from the socket. Refused (and the connection
    /// must close) when the total buffered bytes would exceed the cap;
    /// the oversized chunk is never copied in.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<(), BufferOverflow> {
        if self.buf.len().saturating_add(chunk.len()) > self.cap {
            return Err(BufferOverflow { cap: self.cap });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Drain one complete request frame from the front of the buffer, if
    /// one is available.
    pub fn next_request(&mut self) -> Result<Option<Request>, FrameError> {
        match decode_request(&self.buf)? {
            Some((request, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_request;
    use rmpv::Value;

    fn ping(msgid: u64) -> Request {
        Request {
            msgid,
            method: "ping".into(),
            params: vec![],
            metadata: None,
        }
    }

    #[test]
    fn drains_multiple_frames_in_order() {
        let mut buf = FrameBuffer::new(MIN_BUFFER_CAP);
        let mut bytes = encode_request(&ping(1));
        bytes.extend(encode_request(&ping(2)));
        buf.extend(&bytes).unwrap();

        assert_eq!(buf.next_request().unwrap().unwrap().msgid, 1);
        assert_eq!(buf.next_request().unwrap().unwrap().msgid, 2);
        assert!(buf.next_request().unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let mut buf = FrameBuffer::new(MIN_BUFFER_CAP);
        let bytes = encode_request(&ping(1));
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        buf.extend(head).unwrap();
        assert!(buf.next_request().unwrap().is_none());
        assert_eq!(buf.len(), head.len());

        buf.extend(tail).unwrap();
        assert_eq!(buf.next_request().unwrap().unwrap().msgid, 1);
    }

    #[test]
    fn cap_is_enforced_before_copying() {
        let mut buf = FrameBuffer::new(MIN_BUFFER_CAP);
        let junk = vec![0x91u8; MIN_BUFFER_CAP / 2];
        buf.extend(&junk).unwrap();
        buf.extend(&junk).unwrap();
        let err = buf.extend(&[0u8]).unwrap_err();
        assert_eq!(err.cap, MIN_BUFFER_CAP);
    }

    #[test]
    fn cap_floor_applies() {
        let buf = FrameBuffer::new(16);
        assert_eq!(buf.cap, MIN_BUFFER_CAP);
    }
}
