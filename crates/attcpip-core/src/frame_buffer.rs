//! Reassembly of messages split across socket reads.

use attcpip_protocol::{decode, DecodeError, Message};

/// Bytes received but not yet decoded.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next message off the front of the buffer.
    ///
    /// Returns `None` when more bytes are needed. Undecodable lines are
    /// removed and returned as errors so the caller can log and carry on.
    pub fn next_message(&mut self) -> Option<Result<Message, DecodeError>> {
        match decode(&self.buf) {
            Ok(decoded) => {
                self.buf.drain(..decoded.consumed);
                Some(Ok(decoded.message))
            }
            Err(e) if e.is_incomplete() => {
                self.buf.drain(..e.consumed);
                None
            }
            Err(e) => {
                self.buf.drain(..e.consumed);
                Some(Err(e))
            }
        }
    }

    /// Bytes still buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
