//! Configuration module for the muxd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Request protocol served on the listening socket(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// Fixed-frame arithmetic requests over TCP.
    Calc,
    /// Question/answer sessions over TCP.
    Quiz,
    /// Running maximum of numbers sent by clients over TCP.
    Max,
    /// Ordered chunk reassembly over UDP.
    Chunk,
}

/// How stream connections are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Single-threaded readiness event loop.
    Mio,
    /// One blocking worker thread per client, bounded by a semaphore.
    Threaded,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "muxd")]
#[command(author = "muxd authors")]
#[command(version = "0.1.0")]
#[command(about = "A multiplexed multi-client TCP/UDP request server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum number of concurrently served clients
    #[arg(short = 'n', long)]
    pub max_clients: Option<usize>,

    /// Protocol to serve
    #[arg(short, long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Connection runtime for stream protocols
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Question file for the quiz protocol
    #[arg(short, long)]
    pub quiz_file: Option<PathBuf>,

    /// Additional Unix-domain socket path to accept clients on
    #[arg(long)]
    pub local_socket: Option<PathBuf>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Housekeeping wake-up of the event loop in milliseconds (0 = block)
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub quiz: QuizConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    pub port: Option<u16>,
    /// Maximum number of concurrently served clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolType,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    /// Poll timeout in milliseconds, 0 blocks until an event arrives
    #[serde(default)]
    pub poll_timeout_ms: u64,
    pub local_socket: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            max_clients: default_max_clients(),
            backlog: default_backlog(),
            protocol: default_protocol(),
            runtime: default_runtime(),
            poll_timeout_ms: 0,
            local_socket: None,
        }
    }
}

/// Quiz-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct QuizConfig {
    /// Question file
    pub file: Option<PathBuf>,
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

fn default_max_clients() -> usize {
    3
}

fn default_backlog() -> i32 {
    3
}

fn default_protocol() -> ProtocolType {
    ProtocolType::Calc
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Mio
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub backlog: i32,
    pub protocol: ProtocolType,
    pub runtime: RuntimeType,
    /// `None` blocks the event loop until an event arrives.
    pub poll_timeout: Option<Duration>,
    pub local_socket: Option<PathBuf>,
    pub quiz_file: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    ///
    /// Usage errors terminate the process with status 1, `--help` and
    /// `--version` with status 0.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_parse().unwrap_or_else(|e| {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        });

        // Load TOML config if specified
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

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;

        let port = cli.port.or(server.port).ok_or(ConfigError::MissingPort)?;
        let max_clients = cli.max_clients.unwrap_or(server.max_clients);
        if max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1"));
        }

        let protocol = cli.protocol.unwrap_or(server.protocol);
        let quiz_file = cli.quiz_file.or(toml_config.quiz.file);
        if protocol == ProtocolType::Quiz && quiz_file.is_none() {
            return Err(ConfigError::MissingQuizFile);
        }

        let local_socket = cli.local_socket.or(server.local_socket);
        if protocol == ProtocolType::Chunk && local_socket.is_some() {
            return Err(ConfigError::Invalid("local_socket needs a stream protocol, not chunk"));
        }

        let poll_timeout_ms = cli.poll_timeout_ms.unwrap_or(server.poll_timeout_ms);

        Ok(Config {
            host: cli.host.unwrap_or(server.host),
            port,
            max_clients,
            backlog: cli.backlog.unwrap_or(server.backlog),
            protocol,
            runtime: cli.runtime.unwrap_or(server.runtime),
            poll_timeout: (poll_timeout_ms > 0).then(|| Duration::from_millis(poll_timeout_ms)),
            local_socket,
            quiz_file,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Address string the listening socket binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
impl Config {
    /// Loopback configuration on an ephemeral port, used by runtime tests.
    pub fn loopback(protocol: ProtocolType, max_clients: usize) -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_clients,
            backlog: 16,
            protocol,
            runtime: RuntimeType::Mio,
            poll_timeout: None,
            local_socket: None,
            quiz_file: None,
            log_level: "debug".to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingPort,
    MissingQuizFile,
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
            ConfigError::MissingPort => write!(f, "No port given on the command line or in the config file"),
            ConfigError::MissingQuizFile => write!(f, "The quiz protocol needs a question file (--quiz-file)"),
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
