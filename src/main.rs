//! tinydis: a small in-memory key-value server
//!
//! Clients speak a line-oriented text protocol over TCP. Commands whose
//! last argument is binary-safe send it as a bulk payload after the command
//! line. All clients share one keyspace served from a single-threaded,
//! readiness-driven event loop.
//!
//! Configuration comes from CLI arguments or a TOML file.

mod command;
mod config;
mod object;
mod protocol;
mod runtime;
mod storage;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        event_capacity = config.event_capacity,
        "Starting tinydis server"
    );

    runtime::run(config)?;
    Ok(())
}
