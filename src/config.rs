//! Configuration for the fastsocket server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over file values, which take precedence
//! over defaults.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Bundled service to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Echo,
    Means,
    Heartbeat,
    Kv,
}

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "fastsocket")]
#[command(version)]
#[command(about = "Schema-driven framed TCP services", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., [::]:6969)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Service to run
    #[arg(short = 's', long, value_enum)]
    pub service: Option<Service>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_service")]
    pub service: Service,
    pub workers: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            service: default_service(),
            workers: None,
            max_connections: default_max_connections(),
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
    "[::]:6969".to_string()
}

fn default_service() -> Service {
    Service::Echo
}

fn default_max_connections() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub service: Service,
    pub workers: usize,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI arguments with the TOML file they point to, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path)
                    .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
                toml::from_str(&contents)
                    .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        Ok(Config {
            listen,
            service: cli.service.unwrap_or(toml_config.server.service),
            workers: cli
                .workers
                .or(toml_config.server.workers)
                .unwrap_or_else(default_workers)
                .max(1),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections)
                .max(1),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, std::net::AddrParseError),
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
            ConfigError::InvalidListen(addr, e) => {
                write!(f, "Invalid listen address '{}': {}", addr, e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "fastsocket-config-{}-{}.toml",
            std::process::id(),
            contents.len()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "[::]:6969");
        assert_eq!(config.server.service, Service::Echo);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7000"
            service = "means"
            workers = 4
            max_connections = 64

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.server.service, Service::Means);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_service_rejected() {
        let result: Result<TomlConfig, _> = toml::from_str("[server]\nservice = \"gopher\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::from_args(CliArgs::default()).unwrap();
        assert_eq!(config.listen, "[::]:6969".parse::<SocketAddr>().unwrap());
        assert_eq!(config.service, Service::Echo);
        assert_eq!(config.max_connections, 10_000);
        assert!(config.workers >= 1);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = write_config(
            "[server]\nlisten = \"127.0.0.1:7001\"\nservice = \"kv\"\nworkers = 2\n\n[logging]\nlevel = \"warn\"\n",
        );

        let cli = CliArgs {
            config: Some(path.clone()),
            service: Some(Service::Heartbeat),
            log_level: Some("trace".to_string()),
            ..CliArgs::default()
        };
        let config = Config::from_args(cli).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.listen, "127.0.0.1:7001".parse::<SocketAddr>().unwrap());
        assert_eq!(config.service, Service::Heartbeat);
        assert_eq!(config.workers, 2);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_missing_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/fastsocket.toml")),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }

    #[test]
    fn test_invalid_listen() {
        let cli = CliArgs {
            listen: Some("not-an-address".to_string()),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::InvalidListen(_, _))
        ));
    }
}
