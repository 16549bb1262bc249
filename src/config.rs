//! Configuration module for tcp-beacon.
//!
//! Supports command-line arguments, environment variables and a TOML
//! configuration file. CLI arguments take precedence over environment
//! variables, which take precedence over config file values.

use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the beacon
#[derive(Parser, Debug)]
#[command(name = "tcp-beacon")]
#[command(author = "tcp-beacon authors")]
#[command(version = "0.1.0")]
#[command(about = "Sends a fixed payload to every connected client once per interval", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

/// Operating mode. Serving is the default when no subcommand is given.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the beacon server
    Serve(ServeArgs),
    /// Connect to a beacon and echo every received byte back
    Echo(EchoArgs),
}

/// Flags for the beacon server
#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 127.0.0.1:2111)
    #[arg(short = 'l', long, env = "BEACON_LISTEN")]
    pub listen: Option<String>,

    /// Payload sent to every client on each tick
    #[arg(short = 'p', long, env = "BEACON_PAYLOAD")]
    pub payload: Option<String>,

    /// Milliseconds between payloads
    #[arg(short = 'i', long, env = "BEACON_INTERVAL_MS")]
    pub interval_ms: Option<u64>,

    /// Maximum number of simultaneously served clients
    #[arg(long)]
    pub max_connections: Option<usize>,
}

/// Flags for the echo client
#[derive(clap::Args, Debug)]
pub struct EchoArgs {
    /// Beacon address to connect to
    #[arg(long, env = "BEACON_CONNECT")]
    pub connect: String,

    /// Milliseconds to wait before reconnecting
    #[arg(long)]
    pub reconnect_ms: Option<u64>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub beacon: BeaconConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of simultaneously served clients
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long handlers get to finish after a shutdown signal
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Beacon payload configuration
#[derive(Debug, Deserialize)]
pub struct BeaconConfig {
    /// Bytes written on each tick
    #[serde(default = "default_payload")]
    pub payload: String,
    /// Milliseconds between ticks
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            payload: default_payload(),
            interval_ms: default_interval_ms(),
        }
    }
}

/// Echo client configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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
    "127.0.0.1:2111".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_payload() -> String {
    "t321t".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the process does once configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Accept clients and send them the payload.
    Serve,
    /// Connect to a beacon and reflect its bytes.
    Echo { connect: String },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    pub payload: Bytes,
    pub interval: Duration,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub shutdown_grace: Duration,
    pub reconnect_delay: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: Mode::Serve,
            listen: default_listen(),
            payload: Bytes::from(default_payload()),
            interval: Duration::from_millis(default_interval_ms()),
            max_connections: default_max_connections(),
            workers: None,
            shutdown_grace: Duration::from_millis(default_shutdown_grace_ms()),
            reconnect_delay: Duration::from_millis(default_reconnect_delay_ms()),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args, environment and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed arguments, reading the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let (mode, serve, reconnect_ms) = match cli.command {
            None => (Mode::Serve, cli.serve, None),
            Some(Command::Serve(args)) => (Mode::Serve, args, None),
            Some(Command::Echo(args)) => (
                Mode::Echo {
                    connect: args.connect,
                },
                ServeArgs::default(),
                args.reconnect_ms,
            ),
        };

        let payload = serve.payload.unwrap_or(toml_config.beacon.payload);
        if payload.is_empty() {
            return Err(ConfigError::Invalid("payload must not be empty"));
        }

        let interval_ms = serve.interval_ms.unwrap_or(toml_config.beacon.interval_ms);
        if interval_ms == 0 {
            return Err(ConfigError::Invalid("interval must be at least 1ms"));
        }

        let max_connections = serve
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }

        let workers = cli.workers.or(toml_config.server.workers);
        if workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }

        Ok(Config {
            mode,
            listen: serve.listen.unwrap_or(toml_config.server.listen),
            payload: Bytes::from(payload),
            interval: Duration::from_millis(interval_ms),
            max_connections,
            workers,
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            reconnect_delay: Duration::from_millis(
                reconnect_ms.unwrap_or(toml_config.client.reconnect_delay_ms),
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
