//! Service configuration.
//!
//! Values come from an optional TOML file, then `REPLAY_*` environment
//! variables, then command-line flags (applied by the caller).
//!
//! ```toml
//! [database]
//! path = "events.db"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8000
//!
//! [delivery]
//! max_in_flight = 20
//! method = "PUT"
//!
//! [ingest]
//! batch_size = 10000
//!
//! [log]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};

use logreplay_engine::{CallbackMethod, DeliveryConfig};
use logreplay_ingest::DEFAULT_BATCH_SIZE;
use serde::Deserialize;

pub(crate) const ENV_DB: &str = "REPLAY_DB";
pub(crate) const ENV_HOST: &str = "REPLAY_HOST";
pub(crate) const ENV_PORT: &str = "REPLAY_PORT";
pub(crate) const ENV_MAX_IN_FLIGHT: &str = "REPLAY_MAX_IN_FLIGHT";
pub(crate) const ENV_LOG: &str = "REPLAY_LOG";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("could not read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value '{value}' for {var}: {message}")]
    Env {
        var: &'static str,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    pub(crate) database: DatabaseConfig,
    pub(crate) server: ServerConfig,
    pub(crate) delivery: DeliverySection,
    pub(crate) ingest: IngestSection,
    pub(crate) log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DatabaseConfig {
    pub(crate) path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("events.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ServerConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DeliverySection {
    pub(crate) max_in_flight: usize,
    pub(crate) method: CallbackMethod,
}

impl Default for DeliverySection {
    fn default() -> Self {
        let defaults = DeliveryConfig::default();
        Self {
            max_in_flight: defaults.max_in_flight,
            method: defaults.method,
        }
    }
}

impl DeliverySection {
    pub(crate) fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_in_flight: self.max_in_flight,
            method: self.method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct IngestSection {
    pub(crate) batch_size: usize,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct LogConfig {
    pub(crate) level: String,
    pub(crate) format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load `path` (defaults when absent) and apply the process environment.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub(crate) fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override file values with the `REPLAY_*` variables `lookup` knows.
    pub(crate) fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(db) = lookup(ENV_DB) {
            self.database.path = PathBuf::from(db);
        }
        if let Some(host) = lookup(ENV_HOST) {
            self.server.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = parse_env(ENV_PORT, port)?;
        }
        if let Some(max) = lookup(ENV_MAX_IN_FLIGHT) {
            self.delivery.max_in_flight = parse_env(ENV_MAX_IN_FLIGHT, max)?;
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.log.level = level;
        }
        Ok(())
    }
}

fn parse_env<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        var,
        message: e.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn defaults_match_the_daemon() {
        let config = Config::default();
        assert_eq!(config.database.path, PathBuf::from("events.db"));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.delivery.max_in_flight, 20);
        assert_eq!(config.delivery.method, CallbackMethod::Post);
        assert_eq!(config.ingest.batch_size, 10_000);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Text);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9100

            [delivery]
            method = "PUT"

            [log]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.delivery.method, CallbackMethod::Put);
        assert_eq!(config.delivery.max_in_flight, 20);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[server]\nprot = 1\n").is_err());
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config: Config = toml::from_str("[server]\nport = 9100\n").unwrap();
        config
            .apply_env(env(&[
                (ENV_DB, "/var/lib/replay/events.db"),
                (ENV_PORT, "8123"),
                (ENV_MAX_IN_FLIGHT, "4"),
                (ENV_LOG, "debug"),
                (ENV_HOST, "  "),
            ]))
            .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/replay/events.db"));
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.delivery.max_in_flight, 4);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn malformed_environment_value_is_an_error() {
        let err = Config::default()
            .apply_env(env(&[(ENV_PORT, "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_PORT, .. }), "{err}");
        assert!(err.to_string().contains("eighty"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::read(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
