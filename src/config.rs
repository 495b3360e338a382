//! Configuration module for the chat relay.
//!
//! Supports command-line arguments, the `PORT` environment variable and an
//! optional TOML configuration file. CLI arguments take precedence over the
//! environment, which takes precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(author = "chat-relay authors")]
#[command(version)]
#[command(about = "A WebSocket broadcast relay for chat clients", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// How long to wait for peers to close during shutdown, in milliseconds
    #[arg(long)]
    pub shutdown_grace_ms: Option<u64>,

    /// How long a client may take to complete the WebSocket handshake, in milliseconds
    #[arg(long)]
    pub handshake_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error) [default: info]
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
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shutdown grace period in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
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

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub shutdown_grace: Duration,
    pub handshake_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments, environment and
    /// optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            shutdown_grace: Duration::from_millis(
                cli.shutdown_grace_ms
                    .unwrap_or(toml_config.server.shutdown_grace_ms),
            ),
            handshake_timeout: Duration::from_millis(
                cli.handshake_timeout_ms
                    .unwrap_or(toml_config.server.handshake_timeout_ms),
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    // CLI parsing reads `PORT`, so tests that parse args or touch it run one at a time
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_port_env<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
        let saved = std::env::var("PORT").ok();
        match value {
            Some(v) => std::env::set_var("PORT", v),
            None => std::env::remove_var("PORT"),
        }
        let result = f();
        match saved {
            Some(v) => std::env::set_var("PORT", v),
            None => std::env::remove_var("PORT"),
        }
        result
    }

    fn write_temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "chat-relay-{}-{}.toml",
            name,
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.shutdown_grace_ms, 2000);
        assert_eq!(config.server.handshake_timeout_ms, 10_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9001
            shutdown_grace_ms = 500
            handshake_timeout_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.shutdown_grace_ms, 500);
        assert_eq!(config.server.handshake_timeout_ms, 250);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TomlConfig = toml::from_str("[server]\nport = 7000\n").unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_cli_overrides_file() {
        let _guard = env_lock();
        let path = write_temp_config(
            "override",
            "[server]\nhost = \"127.0.0.1\"\nport = 9001\n[logging]\nlevel = \"warn\"\n",
        );

        let cli = CliArgs::try_parse_from([
            "chat-relay",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9100",
            "--log-level",
            "debug",
        ])
        .unwrap();
        let config = Config::from_args(cli).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9100);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.shutdown_grace, Duration::from_millis(2000));
        assert_eq!(config.handshake_timeout, Duration::from_millis(10_000));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_explicit_info_log_level_overrides_file() {
        let _guard = env_lock();
        let path = write_temp_config("loglevel", "[logging]\nlevel = \"debug\"\n");

        let file_only = CliArgs::try_parse_from(["chat-relay", "-c", path.to_str().unwrap()]).unwrap();
        assert_eq!(Config::from_args(file_only).unwrap().log_level, "debug");

        let cli = CliArgs::try_parse_from([
            "chat-relay",
            "-c",
            path.to_str().unwrap(),
            "--log-level",
            "info",
        ])
        .unwrap();
        assert_eq!(Config::from_args(cli).unwrap().log_level, "info");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_log_level_defaults_to_info() {
        let _guard = env_lock();
        let cli = CliArgs::try_parse_from(["chat-relay"]).unwrap();
        assert_eq!(Config::from_args(cli).unwrap().log_level, "info");
    }

    #[test]
    fn test_port_env_var() {
        let _guard = env_lock();
        let path = write_temp_config("portenv", "[server]\nport = 9001\n");

        with_port_env(Some("9300"), || {
            let cli = CliArgs::try_parse_from(["chat-relay"]).unwrap();
            assert_eq!(Config::from_args(cli).unwrap().port, 9300);

            // Environment beats the file
            let cli = CliArgs::try_parse_from(["chat-relay", "-c", path.to_str().unwrap()]).unwrap();
            assert_eq!(Config::from_args(cli).unwrap().port, 9300);

            // Flag beats the environment
            let cli = CliArgs::try_parse_from(["chat-relay", "--port", "9400"]).unwrap();
            assert_eq!(Config::from_args(cli).unwrap().port, 9400);
        });

        with_port_env(None, || {
            let cli = CliArgs::try_parse_from(["chat-relay", "-c", path.to_str().unwrap()]).unwrap();
            assert_eq!(Config::from_args(cli).unwrap().port, 9001);

            let cli = CliArgs::try_parse_from(["chat-relay"]).unwrap();
            assert_eq!(Config::from_args(cli).unwrap().port, 8080);
        });

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_invalid_port_env_var() {
        let _guard = env_lock();
        with_port_env(Some("not-a-port"), || {
            assert!(CliArgs::try_parse_from(["chat-relay"]).is_err());
        });
    }

    #[test]
    fn test_missing_config_file() {
        let _guard = env_lock();
        let cli = CliArgs::try_parse_from([
            "chat-relay",
            "--config",
            "/nonexistent/chat-relay.toml",
            "--port",
            "8080",
        ])
        .unwrap();

        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(_, _)));
    }

    #[test]
    fn test_invalid_toml() {
        let _guard = env_lock();
        let path = write_temp_config("invalid", "[server\nport = ");
        let cli = CliArgs::try_parse_from(["chat-relay", "-c", path.to_str().unwrap()]).unwrap();

        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_, _)));

        std::fs::remove_file(path).ok();
    }
}
