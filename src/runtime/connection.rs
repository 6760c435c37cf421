//! Client connection state.
//!
//! A connection owns its socket, the raw input accumulated from it, the
//! request parser and the output buffer. All transitions happen inside the
//! readiness callbacks; returning from a callback is the only way to wait.

use crate::command::{self, Dispatch};
use crate::protocol::{Parsed, ProtocolError, Reply, RequestParser, MAX_INLINE_LEN};
use crate::runtime::buffer::{Flush, OutputBuffer};
use crate::runtime::{Readable, Writable};
use crate::storage::Storage;
use bytes::BytesMut;
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{trace, warn};

/// Bytes requested from the socket per read call.
const READ_CHUNK_SIZE: usize = MAX_INLINE_LEN;

/// Reasons a connection is torn down.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Eof,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("client quit")]
    Quit,
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    input: BytesMut,
    parser: RequestParser,
    output: OutputBuffer,
    /// Interest currently registered with the poller.
    interest: Interest,
    /// Recorded on every read; idle connections are not timed out.
    last_interaction: Instant,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap a freshly accepted stream. The caller registers it for read
    /// readiness.
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            input: BytesMut::with_capacity(READ_CHUNK_SIZE),
            parser: RequestParser::new(),
            output: OutputBuffer::new(),
            interest: Interest::READABLE,
            last_interaction: Instant::now(),
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Time since the client last sent anything.
    pub fn idle_for(&self) -> Duration {
        self.last_interaction.elapsed()
    }

    /// Run every command the buffered input completes.
    ///
    /// Returns once the parser needs more bytes. Application errors become
    /// replies; only protocol violations and `quit` end the connection.
    pub fn process_input(&mut self, storage: &mut Storage) -> Result<(), ConnectionError> {
        loop {
            match self.parser.parse(&mut self.input)? {
                Parsed::Incomplete => return Ok(()),
                Parsed::Empty => continue,
                Parsed::Command => {}
            }

            let bulk_resolved = self.parser.bulk_resolved();
            trace!(peer = %self.peer, argc = self.parser.args().len(), bulk_resolved, "Dispatching");
            match command::dispatch(self.parser.args_mut(), bulk_resolved, storage) {
                Dispatch::Reply(reply) => {
                    self.queue_reply(&reply);
                    self.parser.reset();
                }
                Dispatch::ReadBulk => {
                    match self.parser.begin_bulk() {
                        Ok(()) => {
                            trace!(peer = %self.peer, state = ?self.parser.state(), "Awaiting bulk payload");
                        }
                        Err(e) => {
                            warn!(peer = %self.peer, error = %e, "Rejecting bulk command");
                            self.queue_reply(&Reply::invalid_bulk_count());
                            self.parser.reset();
                        }
                    }
                }
                Dispatch::Quit => return Err(ConnectionError::Quit),
            }
        }
    }

    /// Queue a reply behind anything not yet written.
    pub fn queue_reply(&mut self, reply: &[u8]) {
        if self.output.queue(reply) {
            trace!(peer = %self.peer, len = reply.len(), "Output pending");
        }
    }

    /// Interest the poller should hold for this connection, if it differs
    /// from what is registered. Write readiness is only wanted while output
    /// is pending.
    pub fn interest_change(&mut self) -> Option<Interest> {
        let wanted = if self.output.is_drained() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        if wanted == self.interest {
            None
        } else {
            self.interest = wanted;
            Some(wanted)
        }
    }
}

impl<S: Read + Write> Readable for Connection<S> {
    fn on_readable(&mut self, storage: &mut Storage) -> Result<(), ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ConnectionError::Eof),
                Ok(n) => {
                    self.last_interaction = Instant::now();
                    self.input.extend_from_slice(&chunk[..n]);
                    self.process_input(storage)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<S: Read + Write> Writable for Connection<S> {
    fn on_writable(&mut self) -> Result<(), ConnectionError> {
        if self.output.flush_to(&mut self.stream)? == Flush::Pending {
            trace!(peer = %self.peer, remaining = self.output.pending().len(), "Short write");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory stream with scripted read chunks and a write budget.
    #[derive(Default)]
    struct MockStream {
        reads: VecDeque<Vec<u8>>,
        closed: bool,
        written: Vec<u8>,
        write_budget: Option<usize>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(front) = self.reads.front_mut() else {
                return if self.closed {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            };
            let n = buf.len().min(front.len());
            buf[..n].copy_from_slice(&front[..n]);
            front.drain(..n);
            if front.is_empty() {
                self.reads.pop_front();
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.write_budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => buf.len().min(budget),
                None => buf.len(),
            };
            if let Some(budget) = self.write_budget.as_mut() {
                *budget -= n;
            }
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection() -> Connection<MockStream> {
        Connection::new(MockStream::default(), "127.0.0.1:40000".parse().unwrap())
    }

    /// Deliver `chunks` as separate reads within one readiness event.
    fn feed(
        conn: &mut Connection<MockStream>,
        storage: &mut Storage,
        chunks: &[&[u8]],
    ) -> Result<(), ConnectionError> {
        for chunk in chunks {
            conn.stream.reads.push_back(chunk.to_vec());
        }
        conn.on_readable(storage)
    }

    /// Flush pending output and return everything written so far.
    fn drain(conn: &mut Connection<MockStream>) -> Vec<u8> {
        conn.on_writable().unwrap();
        std::mem::take(&mut conn.stream.written)
    }

    fn round_trip(conn: &mut Connection<MockStream>, storage: &mut Storage, input: &[u8]) -> Vec<u8> {
        feed(conn, storage, &[input]).unwrap();
        drain(conn)
    }

    #[test]
    fn test_command_sequence() {
        let mut storage = Storage::new();
        let mut conn = connection();

        assert_eq!(round_trip(&mut conn, &mut storage, b"SET foo 3\r\nbar\r\n"), b"+OK\r\n");
        assert_eq!(round_trip(&mut conn, &mut storage, b"get foo\n"), b"3\r\nbar\r\n");
        assert_eq!(round_trip(&mut conn, &mut storage, b"exists foo\n"), b"1\r\n");
        assert_eq!(round_trip(&mut conn, &mut storage, b"del foo\n"), b"+OK\r\n");
        assert_eq!(round_trip(&mut conn, &mut storage, b"exists foo\n"), b"0\r\n");
    }

    #[test]
    fn test_application_errors_keep_connection() {
        let mut storage = Storage::new();
        let mut conn = connection();

        assert_eq!(
            round_trip(&mut conn, &mut storage, b"bogus\n"),
            b"-ERR unknown command\r\n"
        );
        assert_eq!(
            round_trip(&mut conn, &mut storage, b"get\n"),
            b"-ERR wrong number of arguments\r\n"
        );
        assert_eq!(round_trip(&mut conn, &mut storage, b"ping\n"), b"+PONG\r\n");
    }

    #[test]
    fn test_pipelined_commands_in_one_read() {
        let mut storage = Storage::new();
        let mut conn = connection();

        let out = round_trip(
            &mut conn,
            &mut storage,
            b"ping\r\nset k 2\r\nhi\r\n\r\nget k\r\necho 0\r\n",
        );
        assert_eq!(out, b"+PONG\r\n+OK\r\n2\r\nhi\r\n0\r\n\r\n");
    }

    #[test]
    fn test_fragmentation_does_not_change_replies() {
        let input: &[u8] = b"set key 12\r\nhello\r\nworld\r\nget key\r\nexists key\nping\n";

        let mut storage = Storage::new();
        let mut conn = connection();
        let whole = round_trip(&mut conn, &mut storage, input);

        // One byte per read, all within one readiness event
        let mut storage = Storage::new();
        let mut conn = connection();
        let bytes: Vec<&[u8]> = input.chunks(1).collect();
        feed(&mut conn, &mut storage, &bytes).unwrap();
        assert_eq!(drain(&mut conn), whole);

        // One byte per readiness event
        let mut storage = Storage::new();
        let mut conn = connection();
        for byte in input.chunks(1) {
            feed(&mut conn, &mut storage, &[byte]).unwrap();
        }
        assert_eq!(drain(&mut conn), whole);

        assert_eq!(whole, b"+OK\r\n12\r\nhello\r\nworld\r\n1\r\n+PONG\r\n");
    }

    #[test]
    fn test_oversized_bulk_is_rejected() {
        let mut storage = Storage::new();
        let mut conn = connection();

        let out = round_trip(&mut conn, &mut storage, b"echo 1048577\r\nping\r\n");
        assert_eq!(out, b"-ERR invalid bulk write count\r\n+PONG\r\n");

        assert_eq!(round_trip(&mut conn, &mut storage, b"echo 2\r\nok\r\n"), b"2\r\nok\r\n");
    }

    #[test]
    fn test_non_numeric_bulk_length_reads_as_empty() {
        let mut storage = Storage::new();
        let mut conn = connection();

        let out = round_trip(&mut conn, &mut storage, b"set foo bar\nexists foo\necho hi\n");
        assert_eq!(out, b"+OK\r\n1\r\n0\r\n\r\n");
        assert_eq!(&storage.lookup(b"foo").unwrap().as_bytes().unwrap()[..], b"");
    }

    #[test]
    fn test_negative_bulk_is_rejected() {
        let mut storage = Storage::new();
        let mut conn = connection();

        let out = round_trip(&mut conn, &mut storage, b"set k -1\r\nexists k\r\n");
        assert_eq!(out, b"-ERR invalid bulk write count\r\n0\r\n");
    }

    #[test]
    fn test_line_too_long_closes() {
        let mut storage = Storage::new();
        let mut conn = connection();

        let result = feed(&mut conn, &mut storage, &[&[b'x'; 2048]]);
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(ProtocolError::LineTooLong(_)))
        ));
    }

    #[test]
    fn test_quit_closes_without_reply() {
        let mut storage = Storage::new();
        let mut conn = connection();

        let result = feed(&mut conn, &mut storage, &[b"QUIT\r\nping\r\n"]);
        assert!(matches!(result, Err(ConnectionError::Quit)));
        assert!(conn.output.is_drained());
    }

    #[test]
    fn test_eof() {
        let mut storage = Storage::new();
        let mut conn = connection();
        conn.stream.closed = true;

        let result = feed(&mut conn, &mut storage, &[b"ping\n"]);
        assert!(matches!(result, Err(ConnectionError::Eof)));
        assert_eq!(conn.output.pending(), b"+PONG\r\n");
    }

    #[test]
    fn test_interest_follows_output() {
        let mut storage = Storage::new();
        let mut conn = connection();
        assert_eq!(conn.interest_change(), None);

        feed(&mut conn, &mut storage, &[b"ping\n"]).unwrap();
        assert_eq!(
            conn.interest_change(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert_eq!(conn.interest_change(), None);

        drain(&mut conn);
        assert_eq!(conn.interest_change(), Some(Interest::READABLE));
    }

    #[test]
    fn test_replies_queue_behind_partial_write() {
        let mut storage = Storage::new();
        let mut conn = connection();
        conn.stream.write_budget = Some(4);

        feed(&mut conn, &mut storage, &[b"echo 5\r\nfirst\r\n"]).unwrap();
        conn.on_writable().unwrap();
        assert_eq!(conn.stream.written, b"5\r\nf");

        feed(&mut conn, &mut storage, &[b"ping\r\necho 6\r\nsecond\r\n"]).unwrap();
        assert_eq!(conn.interest_change(), Some(Interest::READABLE | Interest::WRITABLE));

        conn.stream.write_budget = None;
        assert_eq!(drain(&mut conn), b"5\r\nfirst\r\n+PONG\r\n6\r\nsecond\r\n");
        assert_eq!(conn.interest_change(), Some(Interest::READABLE));
    }

    #[test]
    fn test_bulk_payload_across_reads() {
        let mut storage = Storage::new();
        let mut conn = connection();

        feed(&mut conn, &mut storage, &[b"set bin 4\r\n"]).unwrap();
        feed(&mut conn, &mut storage, &[b"a\nb"]).unwrap();
        assert!(conn.output.is_drained());

        feed(&mut conn, &mut storage, &[b"\r\r\n"]).unwrap();
        assert_eq!(drain(&mut conn), b"+OK\r\n");

        let value = storage.lookup(b"bin").unwrap().as_bytes().unwrap();
        assert_eq!(&value[..], b"a\nb\r");
    }

    #[test]
    fn test_last_interaction_recorded() {
        let mut storage = Storage::new();
        let mut conn = connection();
        std::thread::sleep(Duration::from_millis(50));
        assert!(conn.idle_for() >= Duration::from_millis(50));

        feed(&mut conn, &mut storage, &[b"ping\n"]).unwrap();
        assert!(conn.idle_for() < Duration::from_millis(50));
    }
}
