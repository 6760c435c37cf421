//! Per-connection output buffer.
//!
//! Replies are queued in issue order and written from the first unsent byte
//! onward. A write that drains the buffer resets it, so an idle connection
//! holds no pending output and needs no write readiness.

use bytes::BytesMut;
use std::io::{self, Write};

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued has been written.
    Drained,
    /// The socket stopped accepting bytes; the rest stays queued.
    Pending,
}

/// Queued reply bytes plus how many of them have been transmitted.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    buf: BytesMut,
    sent: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every queued byte has been written.
    pub fn is_drained(&self) -> bool {
        self.sent == self.buf.len()
    }

    /// Bytes still waiting to be written.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.sent..]
    }

    /// Queue a reply.
    ///
    /// A drained buffer is replaced outright; otherwise the reply goes after
    /// the bytes still waiting. Returns `true` when the buffer was drained
    /// before, i.e. write readiness has to be requested again.
    pub fn queue(&mut self, reply: &[u8]) -> bool {
        let was_drained = self.is_drained();
        if was_drained {
            self.buf.clear();
            self.sent = 0;
        }
        self.buf.extend_from_slice(reply);
        was_drained
    }

    /// Write as much as `writer` accepts without blocking.
    ///
    /// Keeps writing until the buffer drains or the writer reports
    /// `WouldBlock`. Any other error, including a zero-length write, is
    /// returned and leaves the buffer untouched past the last accepted byte.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<Flush> {
        while !self.is_drained() {
            match writer.write(&self.buf[self.sent..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.buf.clear();
        self.sent = 0;
        Ok(Flush::Drained)
    }
}
