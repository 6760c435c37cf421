//! mio event loop.
//!
//! Readiness-based model: poll reports which sockets are ready, then the
//! matching handler performs non-blocking reads and writes. mio delivers
//! edge-triggered events, so handlers always run until `WouldBlock`.
//!
//! The maintenance tick shares the thread: the poll timeout is the time left
//! until the next tick.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionError};
use crate::runtime::{Readable, Tick, Writable};
use crate::storage::Storage;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const LISTEN_BACKLOG: i32 = 1024;

/// Non-blocking listening socket.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind with address reuse so restarts don't wait out TIME_WAIT.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener: std::net::TcpListener = socket.into();
        Ok(Self {
            inner: TcpListener::from_std(listener),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept one queued connection, or `None` when the queue is empty.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.inner.accept() {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Server context: the poller, the listener, every live connection and the
/// keyspace they share.
pub struct Server {
    poll: Poll,
    listener: Listener,
    connections: Slab<Connection<TcpStream>>,
    storage: Storage,
    event_capacity: usize,
    cron_interval: Duration,
    next_tick: Instant,
}

impl Server {
    /// Bind the listening socket and set up the poller.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = Listener::bind(config.listen)?;
        poll.registry()
            .register(&mut listener.inner, LISTENER_TOKEN, Interest::READABLE)?;

        info!(
            addr = %listener.local_addr()?,
            cron_interval_ms = config.cron_interval.as_millis() as u64,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Server listening"
        );

        Ok(Self {
            poll,
            listener,
            connections: Slab::new(),
            storage: Storage::new(),
            event_capacity: config.event_capacity,
            cron_interval: config.cron_interval,
            next_tick: Instant::now() + config.cron_interval,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until polling fails, then close every connection.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);

        let result = loop {
            if let Err(e) = self.turn(&mut events) {
                error!(error = %e, "Event loop failed");
                break Err(e);
            }
        };

        self.shutdown();
        result
    }

    /// One poll round: dispatch ready events, then the tick if it is due.
    fn turn(&mut self, events: &mut Events) -> io::Result<()> {
        let timeout = self.next_tick.saturating_duration_since(Instant::now());
        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.accept_connections(),
                Token(conn_id) => {
                    if let Err(e) = self.handle_connection_event(conn_id, event) {
                        self.close_connection(conn_id, &e);
                    }
                }
            }
        }

        let now = Instant::now();
        if now >= self.next_tick {
            self.on_tick();
            self.next_tick = now + self.cron_interval;
        }

        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(Some((stream, peer))) => self.register_connection(stream, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let entry = self.connections.vacant_entry();
        let conn_id = entry.key();
        let mut conn = Connection::new(stream, peer);

        if let Err(e) =
            self.poll
                .registry()
                .register(conn.stream_mut(), Token(conn_id), Interest::READABLE)
        {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            return;
        }

        entry.insert(conn);
        debug!(conn_id, peer = %peer, clients = self.connections.len(), "Accepted connection");
    }

    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        event: &Event,
    ) -> Result<(), ConnectionError> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            conn.on_readable(&mut self.storage)?;
        }

        if event.is_writable() {
            conn.on_writable()?;
        }

        if let Some(interest) = conn.interest_change() {
            self.poll
                .registry()
                .reregister(conn.stream_mut(), Token(conn_id), interest)?;
        }

        Ok(())
    }

    /// Deregister and drop a connection; dropping the stream closes it.
    fn close_connection(&mut self, conn_id: usize, reason: &ConnectionError) {
        let Some(mut conn) = self.connections.try_remove(conn_id) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!(conn_id, error = %e, "Deregister failed");
        }

        match reason {
            ConnectionError::Protocol(e) => {
                warn!(conn_id, peer = %conn.peer(), error = %e, "Closing connection on protocol error");
            }
            _ => {
                debug!(
                    conn_id,
                    peer = %conn.peer(),
                    idle = ?conn.idle_for(),
                    reason = %reason,
                    "Connection closed"
                );
            }
        }
    }

    fn shutdown(&mut self) {
        for (conn_id, conn) in self.connections.iter_mut() {
            if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
                debug!(conn_id, error = %e, "Deregister failed");
            }
        }
        let closed = self.connections.len();
        self.connections.clear();
        info!(closed, keys = self.storage.len(), "Server stopped");
    }
}

impl Tick for Server {
    fn on_tick(&mut self) {
        debug!(
            keys = self.storage.len(),
            clients = self.connections.len(),
            "Maintenance tick"
        );
    }
}
