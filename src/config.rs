//! Configuration for the frameline binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::keepalive::KeepAliveConfig;
use crate::server::ServerOptions;
use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "frameline")]
#[command(author = "frameline authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed TCP message server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Interval between connection scans in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Maximum registered connections (0 = unlimited)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds of idle time before the first keep-alive probe
    #[arg(long)]
    pub keepalive_idle: Option<u32>,

    /// Seconds between keep-alive probes
    #[arg(long)]
    pub keepalive_interval: Option<u32>,

    /// Unanswered probes before the peer is considered dead
    #[arg(long)]
    pub keepalive_count: Option<u32>,

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
    pub keepalive: KeepAliveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// 0 = blocking connect
    #[serde(default)]
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            poll_interval_ms: default_poll_interval_ms(),
            max_connections: default_max_connections(),
            read_timeout_ms: default_read_timeout_ms(),
            connect_timeout_ms: 0,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_backlog() -> i32 {
    1024
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_max_connections() -> usize {
    10_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub backlog: i32,
    pub poll_interval_ms: u64,
    pub max_connections: usize,
    pub read_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub keepalive: KeepAliveConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge `cli` over the TOML file it names, if any.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let host = cli.host.unwrap_or(file.server.host);
        let host = host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidHost(host))?;

        Ok(Config {
            host,
            port: cli.port.unwrap_or(file.server.port),
            backlog: cli.backlog.unwrap_or(file.server.backlog),
            poll_interval_ms: cli.poll_interval_ms.unwrap_or(file.server.poll_interval_ms),
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            read_timeout_ms: file.server.read_timeout_ms,
            connect_timeout_ms: file.server.connect_timeout_ms,
            keepalive: KeepAliveConfig {
                idle: cli.keepalive_idle.unwrap_or(file.keepalive.idle),
                interval: cli.keepalive_interval.unwrap_or(file.keepalive.interval),
                count: cli.keepalive_count.unwrap_or(file.keepalive.count),
            },
            log_level: cli.log_level.unwrap_or(file.logging.level),
        })
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        ServerOptions {
            host: config.host,
            port: config.port,
            backlog: config.backlog,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            max_connections: config.max_connections,
            read_timeout: millis(config.read_timeout_ms),
            connect_timeout: millis(config.connect_timeout_ms),
            keepalive: config.keepalive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.poll_interval_ms, 50);
        assert_eq!(config.keepalive, KeepAliveConfig::new(120, 3, 5));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            max_connections = 0
            connect_timeout_ms = 250

            [keepalive]
            idle = 60

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.server.max_connections, 0);
        assert_eq!(config.keepalive, KeepAliveConfig::new(60, 3, 5));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str("[server]\nport = 9000\n").unwrap();
        let cli = CliArgs {
            port: Some(7000),
            keepalive_count: Some(9),
            log_level: Some("trace".to_string()),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.keepalive.count, 9);
        assert_eq!(config.keepalive.idle, 120);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_invalid_host() {
        let cli = CliArgs {
            host: Some("not-an-ip".to_string()),
            ..CliArgs::default()
        };
        let err = Config::merge(cli, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHost(ref h) if h == "not-an-ip"));
    }

    #[test]
    fn test_into_server_options() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default()).unwrap();
        let options = ServerOptions::from(&config);
        assert!(options.host.is_unspecified());
        assert_eq!(options.port, 8080);
        assert_eq!(options.read_timeout, Some(Duration::from_millis(5000)));
        assert_eq!(options.connect_timeout, None);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/frameline.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::resolve(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}
