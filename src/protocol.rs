//! Inline text protocol parser and reply encoder.
//!
//! Requests are space-separated lines terminated by `\n` (an optional `\r`
//! before it is stripped). Commands tagged as bulk-trailing carry a decimal
//! byte count as their last token; that many raw bytes plus a two byte
//! terminator follow the line and become the final argument.
//!
//! The parser is resumable: it owns the argument list and its phase, and
//! only ever consumes complete lines or complete bulk payloads from the
//! caller's input buffer. Anything short of that is left in place until the
//! next read.
//!
//! Every argument gets its own allocation, so a stored key or value never
//! pins the connection's read buffer.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Longest input accepted while waiting for a line terminator
pub const MAX_INLINE_LEN: usize = 1024;

/// Maximum number of arguments kept from a single line
pub const MAX_ARGS: usize = 16;

/// Largest bulk payload a client may declare
pub const MAX_BULK_LEN: i64 = 1024 * 1024;

/// Length of the terminator following a bulk payload
const BULK_TERMINATOR_LEN: usize = 2;

/// Protocol violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffered input reached the ceiling without a line terminator
    #[error("no line terminator within {0} buffered bytes")]
    LineTooLong(usize),
    /// Declared bulk length is outside `0..=MAX_BULK_LEN`
    #[error("invalid bulk write count '{0}'")]
    InvalidBulkLength(String),
}

/// Phase of the request currently being assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for a command line
    Line,
    /// Waiting for `pending` bytes: the bulk payload plus its terminator
    Bulk { pending: usize },
    /// Arguments complete, bulk argument already substituted
    Ready,
}

/// Outcome of a parse step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    /// Not enough buffered bytes; wait for the next read
    Incomplete,
    /// A blank line was consumed; nothing to dispatch
    Empty,
    /// The argument list is ready for dispatch
    Command,
}

/// Per-connection request parser
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    args: Vec<Bytes>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Line,
            args: Vec::with_capacity(MAX_ARGS),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut Vec<Bytes> {
        &mut self.args
    }

    /// Whether the trailing bulk argument has been read already
    pub fn bulk_resolved(&self) -> bool {
        self.state == ParseState::Ready
    }

    /// Advance the parser over `input`, consuming whatever it completes.
    pub fn parse(&mut self, input: &mut BytesMut) -> Result<Parsed, ProtocolError> {
        match self.state {
            ParseState::Line => self.parse_line(input),
            ParseState::Bulk { pending } => Ok(self.parse_bulk(input, pending)),
            ParseState::Ready => Ok(Parsed::Command),
        }
    }

    fn parse_line(&mut self, input: &mut BytesMut) -> Result<Parsed, ProtocolError> {
        let newline = match input.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None if input.len() >= MAX_INLINE_LEN => {
                return Err(ProtocolError::LineTooLong(input.len()))
            }
            None => return Ok(Parsed::Incomplete),
        };

        let line = match &input[..newline] {
            [rest @ .., b'\r'] => rest,
            line => line,
        };

        self.args.clear();
        let tokens = line
            .split(|&b| b == b' ')
            .filter(|token| !token.is_empty())
            .take(MAX_ARGS)
            .map(Bytes::copy_from_slice);
        self.args.extend(tokens);
        input.advance(newline + 1);

        if self.args.is_empty() {
            Ok(Parsed::Empty)
        } else {
            Ok(Parsed::Command)
        }
    }

    fn parse_bulk(&mut self, input: &mut BytesMut, pending: usize) -> Parsed {
        if input.len() < pending {
            return Parsed::Incomplete;
        }

        let payload = Bytes::copy_from_slice(&input[..pending - BULK_TERMINATOR_LEN]);
        input.advance(pending);
        self.args.push(payload);
        self.state = ParseState::Ready;
        Parsed::Command
    }

    /// Replace the last argument, a declared byte count, by its payload.
    ///
    /// A zero count resolves immediately to an empty argument. Any other
    /// valid count switches to the bulk phase; the payload is picked up by
    /// the next call to [`parse`](Self::parse), which may find it already
    /// buffered.
    pub fn begin_bulk(&mut self) -> Result<(), ProtocolError> {
        let token = self
            .args
            .pop()
            .ok_or_else(|| ProtocolError::InvalidBulkLength(String::new()))?;

        match parse_bulk_len(&token)? {
            0 => {
                self.args.push(Bytes::new());
                self.state = ParseState::Ready;
            }
            len => {
                self.state = ParseState::Bulk {
                    pending: len + BULK_TERMINATOR_LEN,
                };
            }
        }
        Ok(())
    }

    /// Drop the current arguments and wait for a new line
    pub fn reset(&mut self) {
        self.args.clear();
        self.state = ParseState::Line;
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a bulk length from the leading integer of `token`.
///
/// Leading whitespace and one sign are accepted, digits are read up to the
/// first non-digit, and a token without digits counts as zero. Only the
/// resulting value is range checked.
fn parse_bulk_len(token: &[u8]) -> Result<usize, ProtocolError> {
    let start = token
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(token.len());
    let (negative, digits) = match &token[start..] {
        [b'-', rest @ ..] => (true, rest),
        [b'+', rest @ ..] => (false, rest),
        rest => (false, rest),
    };

    let magnitude = digits
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0i64, |acc, b| {
            acc.saturating_mul(10).saturating_add(i64::from(b - b'0'))
        });
    let len = if negative { -magnitude } else { magnitude };

    if (0..=MAX_BULK_LEN).contains(&len) {
        Ok(len as usize)
    } else {
        Err(ProtocolError::InvalidBulkLength(
            String::from_utf8_lossy(token).into_owned(),
        ))
    }
}

/// Reply encoder
pub struct Reply;

impl Reply {
    /// `+PONG`
    pub fn pong() -> Bytes {
        Bytes::from_static(b"+PONG\r\n")
    }

    /// `+OK`
    pub fn ok() -> Bytes {
        Bytes::from_static(b"+OK\r\n")
    }

    /// Length-prefixed payload
    pub fn bulk(payload: &[u8]) -> Bytes {
        let header = format!("{}\r\n", payload.len());
        let mut out = BytesMut::with_capacity(header.len() + payload.len() + 2);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(b"\r\n");
        out.freeze()
    }

    /// Sentinel for a missing key
    pub fn nil() -> Bytes {
        Bytes::from_static(b"0\r\n\r\n")
    }

    /// Error carried in a bulk reply, signalled by a negative length
    pub fn bulk_error(msg: &str) -> Bytes {
        Bytes::from(format!("-{}\r\n{}\r\n", msg.len(), msg))
    }

    /// `1` or `0`
    pub fn boolean(value: bool) -> Bytes {
        if value {
            Bytes::from_static(b"1\r\n")
        } else {
            Bytes::from_static(b"0\r\n")
        }
    }

    pub fn unknown_command() -> Bytes {
        Bytes::from_static(b"-ERR unknown command\r\n")
    }

    pub fn wrong_arity() -> Bytes {
        Bytes::from_static(b"-ERR wrong number of arguments\r\n")
    }

    pub fn invalid_bulk_count() -> Bytes {
        Bytes::from_static(b"-ERR invalid bulk write count\r\n")
    }
}
