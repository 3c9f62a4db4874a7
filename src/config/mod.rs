//! Configuration Module
//!
//! TOML-based configuration with `${VAR}` / `${VAR:-default}` substitution
//! and `DRIFTMQ_*` environment overrides. The file mirrors the broker's
//! runtime knobs: bind address, connection limits, the maximum accepted
//! packet size, and session keep-alive bounds.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::codec::MAX_REMAINING_LENGTH;
use crate::protocol::QoS;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Session configuration
    pub session: SessionConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().unwrap(),
        }
    }
}

/// Connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
    /// Per-connection outbound queue depth
    pub outbound_queue: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            outbound_queue: 1024,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep alive applied when a client asks for 0, in seconds
    pub default_keep_alive: u16,
    /// Upper bound on the negotiated keep alive, in seconds
    pub max_keep_alive: u16,
    /// Highest QoS granted to subscriptions (0, 1 or 2)
    pub max_qos: u8,
    /// Seconds a fresh socket may sit without sending CONNECT
    pub connect_timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: 60,
            max_keep_alive: 65535,
            max_qos: 2,
            connect_timeout: 30,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, applying `${VAR}` substitution
    /// and `DRIFTMQ_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let cfg: Config = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .add_source(Environment::with_prefix("DRIFTMQ").separator("__"))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.log.level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown log level: {}",
                self.log.level
            )));
        }

        if self.limits.max_packet_size < 2 || self.limits.max_packet_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "max_packet_size must be between 2 and {}",
                MAX_REMAINING_LENGTH
            )));
        }

        if self.limits.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if self.limits.outbound_queue == 0 {
            return Err(ConfigError::Validation(
                "outbound_queue must be at least 1".to_string(),
            ));
        }

        if self.session.max_qos > 2 {
            return Err(ConfigError::Validation(format!(
                "max_qos must be 0, 1 or 2, got {}",
                self.session.max_qos
            )));
        }

        if self.session.connect_timeout == 0 {
            return Err(ConfigError::Validation(
                "connect_timeout must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }

    /// Map the file configuration onto the broker's runtime configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            default_keep_alive: self.session.default_keep_alive,
            max_keep_alive: self.session.max_keep_alive,
            max_qos: QoS::from_u8(self.session.max_qos).unwrap_or(QoS::ExactlyOnce),
            connect_timeout: Duration::from_secs(self.session.connect_timeout),
            outbound_channel_capacity: self.limits.outbound_queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.bind.port(), 1883);
        assert_eq!(cfg.limits.max_packet_size, 1024 * 1024);
    }

    #[test]
    fn loads_a_partial_file() {
        let file = write_config(
            r#"
[server]
bind = "127.0.0.1:2883"

[limits]
max_packet_size = 4096
"#,
        );

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.server.bind.port(), 2883);
        assert_eq!(cfg.limits.max_packet_size, 4096);
        // Untouched sections keep their defaults
        assert_eq!(cfg.session.default_keep_alive, 60);
    }

    #[test]
    fn substitutes_environment_variables() {
        std::env::set_var("DRIFTMQ_TEST_PORT_VALUE", "3883");
        let file = write_config(
            r#"
[server]
bind = "127.0.0.1:${DRIFTMQ_TEST_PORT_VALUE}"

[log]
level = "${DRIFTMQ_TEST_MISSING:-debug}"
"#,
        );

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.server.bind.port(), 3883);
        assert_eq!(cfg.log.level, "debug");
        std::env::remove_var("DRIFTMQ_TEST_PORT_VALUE");
    }

    #[test]
    fn rejects_invalid_values() {
        let mut cfg = Config::default();
        cfg.session.max_qos = 3;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = Config::default();
        cfg.limits.max_packet_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.log.level = "noisy".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn maps_onto_broker_config() {
        let mut cfg = Config::default();
        cfg.session.max_qos = 1;
        cfg.limits.outbound_queue = 16;

        let broker = cfg.broker_config();
        assert_eq!(broker.max_qos, QoS::AtLeastOnce);
        assert_eq!(broker.outbound_channel_capacity, 16);
        assert_eq!(broker.connect_timeout, Duration::from_secs(30));
    }
}
