//! Configuration module for tick-push.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the notification server
#[derive(Parser, Debug, Default)]
#[command(name = "tick-push")]
#[command(author = "tick-push authors")]
#[command(version = "0.1.0")]
#[command(about = "Streams periodic time notifications to TCP clients", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Delay between two notifications on a connection, in milliseconds
    #[arg(short = 'i', long)]
    pub interval_ms: Option<u64>,

    /// Longest request line read from a client, in bytes
    #[arg(long)]
    pub max_request_line: Option<u64>,

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
    pub notify: NotifyConfig,
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
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

/// Push stream configuration
#[derive(Debug, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_request_line")]
    pub max_request_line: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_request_line: default_max_request_line(),
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
    "0.0.0.0:8080".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_request_line() -> u64 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub interval: Duration,
    pub max_request_line: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            interval: Duration::from_millis(default_interval_ms()),
            max_request_line: default_max_request_line(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let interval_ms = cli.interval_ms.unwrap_or(toml_config.notify.interval_ms);
        if interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be greater than zero"));
        }

        let max_request_line = cli
            .max_request_line
            .unwrap_or(toml_config.notify.max_request_line);
        if max_request_line == 0 {
            return Err(ConfigError::Invalid(
                "max_request_line must be greater than zero",
            ));
        }

        let workers = cli.workers.or(toml_config.server.workers);
        if workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be greater than zero"));
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers,
            interval: Duration::from_millis(interval_ms),
            max_request_line,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
