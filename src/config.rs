//! Configuration module for the tinydis server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "tinydis")]
#[command(version = "0.1.0")]
#[command(about = "A small in-memory key-value server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:6379)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Interval between maintenance ticks in milliseconds
    #[arg(long)]
    pub cron_interval_ms: Option<u64>,

    /// Idle client timeout in seconds
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Maximum readiness events handled per poll
    #[arg(long)]
    pub event_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Seconds; recorded and reported, clients are never dropped for it
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            event_capacity: default_event_capacity(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_cron_interval_ms")]
    pub cron_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cron_interval_ms: default_cron_interval_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_cron_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub event_capacity: usize,
    pub idle_timeout: Duration,
    pub cron_interval: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 6379)),
            event_capacity: default_event_capacity(),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
            cron_interval: Duration::from_millis(default_cron_interval_ms()),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI arguments over the TOML file they point to, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|source| ConfigError::InvalidListen {
                addr: listen.clone(),
                source,
            })?;

        let cron_interval_ms = cli
            .cron_interval_ms
            .unwrap_or(toml_config.maintenance.cron_interval_ms)
            .max(1);

        Ok(Config {
            listen,
            event_capacity: cli
                .event_capacity
                .unwrap_or(toml_config.server.event_capacity)
                .max(1),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout
                    .unwrap_or(toml_config.server.idle_timeout),
            ),
            cron_interval: Duration::from_millis(cron_interval_ms),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid listen address '{addr}': {source}")]
    InvalidListen {
        addr: String,
        source: AddrParseError,
    },
}
