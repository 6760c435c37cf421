//! Single-threaded, readiness-based runtime.
//!
//! One mio poller drives everything:
//! - `event_loop`: listener, connection registry and maintenance tick
//! - `connection`: per-client parsing, dispatch and reply delivery
//! - `buffer`: output buffering across partial writes
//!
//! Components react to readiness through the small handler traits below;
//! the event loop owns scheduling and interest registration.

mod buffer;
mod connection;
mod event_loop;

pub(crate) use connection::ConnectionError;
pub(crate) use event_loop::Server;

use crate::config::Config;
use crate::storage::Storage;

/// Reaction to read readiness.
pub(crate) trait Readable {
    /// Consume everything the socket has to offer and run the commands it
    /// completes against `storage`.
    fn on_readable(&mut self, storage: &mut Storage) -> Result<(), ConnectionError>;
}

/// Reaction to write readiness.
pub(crate) trait Writable {
    /// Write pending output until it drains or the socket would block.
    fn on_writable(&mut self) -> Result<(), ConnectionError>;
}

/// Reaction to the recurring maintenance timer. Must not block.
pub(crate) trait Tick {
    fn on_tick(&mut self);
}

/// Bind the listener and serve until the poller fails.
pub fn run(config: Config) -> std::io::Result<()> {
    Server::bind(&config)?.run()
}
