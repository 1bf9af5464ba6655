//! Configuration module for mux-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::session::{ClientSettings, ReliabilityMode, ServerSettings};
use crate::transfer::{Labels, DEFAULT_AMPLIFICATION};
use clap::Parser;
use serde::Deserialize;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Which end of the benchmark to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    #[default]
    Server,
}

/// Command-line arguments for the benchmark
#[derive(Parser, Debug)]
#[command(name = "mux-bench")]
#[command(author = "mux-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Throughput benchmark over multiplexed reliable streams", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as client or server
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Host to connect to, or address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to connect to or listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Bytes the client requests; the reply is this times the amplification
    #[arg(short, long)]
    pub bytes: Option<u64>,

    /// Reply multiplier (client and server must agree)
    #[arg(long)]
    pub amplification: Option<u64>,

    /// Largest single write offered to a stream
    #[arg(long)]
    pub chunk_size: Option<u32>,

    /// Initial per-stream send credit in bytes
    #[arg(long)]
    pub stream_window: Option<u32>,

    /// Request partial reliability
    #[arg(long = "pr")]
    pub partial_reliability: bool,

    /// Number of server worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Client connect timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Give up on a client run after this many seconds (0 waits forever)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Latency label printed with the result
    #[arg(long)]
    pub latency: Option<String>,

    /// Loss percentage label printed with the result
    #[arg(long)]
    pub loss: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Role and endpoint
#[derive(Debug, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Client run configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_bytes")]
    pub bytes: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_label")]
    pub latency: String,
    #[serde(default = "default_label")]
    pub loss: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bytes: default_bytes(),
            connect_timeout_ms: default_connect_timeout_ms(),
            timeout_secs: default_timeout_secs(),
            latency: default_label(),
            loss: default_label(),
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    /// Number of worker threads
    pub workers: Option<usize>,
}

/// Transfer tuning shared by both roles
#[derive(Debug, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_amplification")]
    pub amplification: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_stream_window")]
    pub stream_window: u32,
    #[serde(default)]
    pub partial_reliability: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            amplification: default_amplification(),
            chunk_size: default_chunk_size(),
            stream_window: default_stream_window(),
            partial_reliability: false,
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
    "::1".to_string()
}

fn default_port() -> u16 {
    6668
}

fn default_bytes() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_label() -> String {
    "-".to_string()
}

fn default_amplification() -> u64 {
    DEFAULT_AMPLIFICATION
}

fn default_chunk_size() -> u32 {
    6000
}

fn default_stream_window() -> u32 {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub bytes: u64,
    pub amplification: u64,
    pub chunk_size: u32,
    pub stream_window: u32,
    pub partial_reliability: bool,
    pub workers: Option<usize>,
    pub connect_timeout_ms: u64,
    pub timeout_secs: u64,
    pub latency: String,
    pub loss: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            mode: cli.mode.unwrap_or(toml_config.bench.mode),
            host: cli.host.unwrap_or(toml_config.bench.host),
            port: cli.port.unwrap_or(toml_config.bench.port),
            bytes: cli.bytes.unwrap_or(toml_config.client.bytes),
            amplification: cli
                .amplification
                .unwrap_or(toml_config.transfer.amplification),
            chunk_size: cli.chunk_size.unwrap_or(toml_config.transfer.chunk_size),
            stream_window: cli
                .stream_window
                .unwrap_or(toml_config.transfer.stream_window),
            partial_reliability: cli.partial_reliability
                || toml_config.transfer.partial_reliability,
            workers: cli.workers.or(toml_config.server.workers),
            connect_timeout_ms: cli
                .connect_timeout_ms
                .unwrap_or(toml_config.client.connect_timeout_ms),
            timeout_secs: cli.timeout.unwrap_or(toml_config.client.timeout_secs),
            latency: cli.latency.unwrap_or(toml_config.client.latency),
            loss: cli.loss.unwrap_or(toml_config.client.loss),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".to_string()));
        }
        if self.stream_window == 0 {
            return Err(ConfigError::Invalid(
                "stream_window must be at least 1".to_string(),
            ));
        }
        if self.amplification == 0 {
            return Err(ConfigError::Invalid(
                "amplification must be at least 1".to_string(),
            ));
        }
        if self.bytes.checked_mul(self.amplification).is_none() {
            return Err(ConfigError::Invalid(format!(
                "{} bytes amplified {} times overflows",
                self.bytes, self.amplification
            )));
        }
        Ok(())
    }

    /// Resolve `host:port` to the first matching socket address.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address found for {}", self.host),
                )
            })
    }

    pub fn reliability(&self) -> ReliabilityMode {
        if self.partial_reliability {
            ReliabilityMode::Partial
        } else {
            ReliabilityMode::Full
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            requested_bytes: self.bytes,
            amplification: self.amplification,
            chunk_size: self.chunk_size,
            reliability: self.reliability(),
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            amplification: self.amplification,
            chunk_size: self.chunk_size,
            reliability: self.reliability(),
        }
    }

    pub fn labels(&self) -> Labels {
        Labels {
            latency: self.latency.clone(),
            loss: self.loss.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["mux-bench"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(&[]), TomlConfig::default());
        assert_eq!(config.mode, Mode::Server);
        assert_eq!(config.host, "::1");
        assert_eq!(config.port, 6668);
        assert_eq!(config.bytes, 1_048_576);
        assert_eq!(config.amplification, 10);
        assert_eq!(config.chunk_size, 6000);
        assert_eq!(config.stream_window, 65536);
        assert_eq!(config.workers, None);
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.reliability(), ReliabilityMode::Full);
        assert_eq!(config.labels(), Labels::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [bench]
            mode = "client"
            host = "192.0.2.1"
            port = 7000

            [client]
            bytes = 100
            timeout_secs = 30
            latency = "50ms"

            [server]
            workers = 4

            [transfer]
            amplification = 3
            chunk_size = 1400
            partial_reliability = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bench.mode, Mode::Client);
        assert_eq!(config.bench.host, "192.0.2.1");
        assert_eq!(config.bench.port, 7000);
        assert_eq!(config.client.bytes, 100);
        assert_eq!(config.client.timeout_secs, 30);
        assert_eq!(config.client.latency, "50ms");
        assert_eq!(config.client.loss, "-");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.transfer.amplification, 3);
        assert_eq!(config.transfer.chunk_size, 1400);
        assert_eq!(config.transfer.stream_window, 65536);
        assert!(config.transfer.partial_reliability);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_takes_precedence() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [bench]
            port = 7000
            host = "127.0.0.1"

            [client]
            bytes = 100
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--mode", "client", "-p", "7001", "--pr", "--loss", "1"]),
            toml_config,
        );
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.port, 7001);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.bytes, 100);
        assert_eq!(config.reliability(), ReliabilityMode::Partial);

        let settings = config.client_settings();
        assert_eq!(settings.requested_bytes, 100);
        assert_eq!(settings.expected_reply(), 1000);
        assert_eq!(config.labels().loss, "1");
        assert_eq!(
            config.socket_addr().unwrap(),
            "127.0.0.1:7001".parse().unwrap()
        );
    }

    #[test]
    fn test_run_timeout_zero_disables() {
        let config = Config::merge(cli(&["--timeout", "0"]), TomlConfig::default());
        assert_eq!(config.run_timeout(), None);

        let toml_config: TomlConfig = toml::from_str("[client]\ntimeout_secs = 0").unwrap();
        let config = Config::merge(cli(&["--timeout", "7"]), toml_config);
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_validation() {
        let base = Config::merge(cli(&[]), TomlConfig::default());

        for invalid in [
            Config {
                chunk_size: 0,
                ..base.clone()
            },
            Config {
                stream_window: 0,
                ..base.clone()
            },
            Config {
                amplification: 0,
                ..base.clone()
            },
            Config {
                bytes: u64::MAX / 2,
                ..base.clone()
            },
            Config {
                host: String::new(),
                ..base.clone()
            },
        ] {
            assert!(matches!(invalid.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_bad_mode_rejected() {
        assert!(CliArgs::try_parse_from(["mux-bench", "--mode", "proxy"]).is_err());
        assert!(toml::from_str::<TomlConfig>("[bench]\nmode = \"proxy\"").is_err());
    }
}
