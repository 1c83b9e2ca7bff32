//! Configuration for the emulator process.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Physical serial device.
    Serial,
    /// Single-peer TCP listener, for testing without hardware.
    Tcp,
}

/// Command-line arguments for the emulator
#[derive(Parser, Debug)]
#[command(name = "vsp-emu")]
#[command(version = "0.1.0")]
#[command(about = "Virtual sensor protocol emulator", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Transport to serve on
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Serial device path (e.g. /dev/ttyUSB0)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// TCP listen address (e.g. 127.0.0.1:9600)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Expected API version for the handshake
    #[arg(long)]
    pub api_version: Option<String>,

    /// Expected DB version for the handshake
    #[arg(long)]
    pub db_version: Option<String>,

    /// Accept request frames without a trailing newline
    #[arg(long)]
    pub lenient_framing: bool,

    /// Report catalog readings without synthetic jitter
    #[arg(long)]
    pub no_jitter: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport-related configuration
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    /// Which transport to serve on
    #[serde(default = "default_transport")]
    pub kind: TransportKind,
    /// Serial device path
    #[serde(default = "default_device")]
    pub device: String,
    /// Serial baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// TCP listen address
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport(),
            device: default_device(),
            baud: default_baud(),
            listen: default_listen(),
        }
    }
}

/// Handshake version configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_db_version")]
    pub db_version: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            db_version: default_db_version(),
        }
    }
}

/// Emulator behavior configuration
#[derive(Debug, Deserialize)]
pub struct EmulatorConfig {
    /// Accept request frames without a trailing newline
    #[serde(default)]
    pub lenient_framing: bool,
    /// Apply synthetic jitter to reported readings
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            lenient_framing: false,
            jitter: default_jitter(),
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

fn default_transport() -> TransportKind {
    TransportKind::Serial
}

fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    115_200
}

fn default_listen() -> String {
    "127.0.0.1:9600".to_string()
}

fn default_api_version() -> String {
    "1.2".to_string()
}

fn default_db_version() -> String {
    "1.0.0".to_string()
}

fn default_jitter() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportKind,
    pub device: String,
    pub baud: u32,
    pub listen: String,
    pub api_version: String,
    pub db_version: String,
    pub lenient_framing: bool,
    pub jitter: bool,
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

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            transport: cli.transport.unwrap_or(toml_config.transport.kind),
            device: cli.device.unwrap_or(toml_config.transport.device),
            baud: cli.baud.unwrap_or(toml_config.transport.baud),
            listen: cli.listen.unwrap_or(toml_config.transport.listen),
            api_version: cli.api_version.unwrap_or(toml_config.protocol.api_version),
            db_version: cli.db_version.unwrap_or(toml_config.protocol.db_version),
            lenient_framing: cli.lenient_framing || toml_config.emulator.lenient_framing,
            jitter: !cli.no_jitter && toml_config.emulator.jitter,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.transport.kind, TransportKind::Serial);
        assert_eq!(config.transport.device, "/dev/ttyUSB0");
        assert_eq!(config.transport.baud, 115_200);
        assert_eq!(config.protocol.api_version, "1.2");
        assert_eq!(config.protocol.db_version, "1.0.0");
        assert!(!config.emulator.lenient_framing);
        assert!(config.emulator.jitter);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [transport]
            kind = "tcp"
            listen = "0.0.0.0:9600"

            [protocol]
            api_version = "2.0"
            db_version = "1.1.0"

            [emulator]
            lenient_framing = true
            jitter = false

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transport.kind, TransportKind::Tcp);
        assert_eq!(config.transport.listen, "0.0.0.0:9600");
        // Unset fields fall back to defaults
        assert_eq!(config.transport.device, "/dev/ttyUSB0");
        assert_eq!(config.protocol.api_version, "2.0");
        assert_eq!(config.protocol.db_version, "1.1.0");
        assert!(config.emulator.lenient_framing);
        assert!(!config.emulator.jitter);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_toml_partial_sections() {
        let config: TomlConfig = toml::from_str("[transport]\nbaud = 9600\n").unwrap();
        assert_eq!(config.transport.baud, 9600);
        assert_eq!(config.transport.kind, TransportKind::Serial);
        assert_eq!(config.protocol.api_version, "1.2");
        assert_eq!(config.logging.level, "info");
    }
}
