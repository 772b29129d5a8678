//! Adapter configuration
//!
//! Loaded from an optional TOML file layered under `MQGATE_`-prefixed
//! environment variables. File contents may reference environment variables
//! with `${VAR}` or `${VAR:-default}` before parsing.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(config::ConfigError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Parse(e) => write!(f, "failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        Self::Parse(e)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub log: LogConfig,
    pub amqp: AmqpConfig,
    pub session: SessionConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            amqp: AmqpConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log filter directive, e.g. "info" or "mqgate=debug"
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// Topic exchange all MQTT traffic is routed through
    pub exchange: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            exchange: "amq.topic".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle lifetime of a persistent session's queues
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AdapterConfig {
    /// Load from an optional file, with `MQGATE_` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_toml(&raw)
            }
            None => {
                let config = Config::builder()
                    .add_source(Environment::with_prefix("MQGATE").separator("__"))
                    .build()?;
                Ok(config.try_deserialize()?)
            }
        }
    }

    /// Parse a TOML document, expanding `${VAR}` references first
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let expanded = substitute_env_vars(raw);
        let config = Config::builder()
            .add_source(File::from_str(&expanded, FileFormat::Toml))
            .add_source(Environment::with_prefix("MQGATE").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

/// Expand `${VAR}` and `${VAR:-default}` using the process environment
fn substitute_env_vars(raw: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap();
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string(),
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdapterConfig::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.amqp.exchange, "amq.topic");
        assert_eq!(config.session.expiry, Duration::from_secs(86400));
    }

    #[test]
    fn test_from_toml() {
        let config = AdapterConfig::from_toml(
            r#"
            [log]
            level = "debug"

            [amqp]
            exchange = "mqtt.topic"

            [session]
            expiry = "1h"
            "#,
        )
        .unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.amqp.exchange, "mqtt.topic");
        assert_eq!(config.session.expiry, Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AdapterConfig::from_toml(
            r#"
            [amqp]
            exchange = "custom"
            "#,
        )
        .unwrap();

        assert_eq!(config.amqp.exchange, "custom");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.session.expiry, Duration::from_secs(86400));
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("MQGATE_TEST_EXCHANGE", "from-env");

        assert_eq!(
            substitute_env_vars("exchange = \"${MQGATE_TEST_EXCHANGE}\""),
            "exchange = \"from-env\""
        );
        assert_eq!(
            substitute_env_vars("exchange = \"${MQGATE_TEST_UNSET:-fallback}\""),
            "exchange = \"fallback\""
        );
        assert_eq!(
            substitute_env_vars("exchange = \"${MQGATE_TEST_UNSET}\""),
            "exchange = \"\""
        );
    }
}
