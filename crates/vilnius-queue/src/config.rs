//! Queue configuration
//!
//! Read from an optional TOML file plus `VILNIUS__`-prefixed environment
//! variables, e.g. `VILNIUS__QUEUE__DEFAULT=database`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigurationError;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "vilnius.toml";

/// Top-level settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Absent queue configuration means the sync driver
    #[serde(default)]
    pub queue: Option<QueueConfig>,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        use config::{Config, Environment, File};

        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("VILNIUS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Connection used when none is named explicitly
    #[serde(default = "default_connection_name")]
    pub default: String,
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

fn default_connection_name() -> String {
    "sync".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default: default_connection_name(),
            connections: HashMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig, ConfigurationError> {
        self.connections
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownConnection(name.to_string()))
    }

    pub fn default_connection(&self) -> Result<&ConnectionConfig, ConfigurationError> {
        self.connection(&self.default)
    }
}

/// One named connection: a driver name plus driver-specific parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub driver: String,
    /// Table name for the database driver
    #[serde(default)]
    pub table: Option<String>,
    /// Storage URL, e.g. `sqlite:vilnius.db?mode=rwc`
    #[serde(default)]
    pub url: Option<String>,
    /// Queue used by this connection when the caller names none
    #[serde(default)]
    pub queue: Option<String>,
    /// Seconds after which a reserved job is handed out again
    #[serde(default)]
    pub retry_after: Option<u64>,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

impl ConnectionConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            ..Default::default()
        }
    }

    pub fn require_url(&self, connection: &str) -> Result<&str, ConfigurationError> {
        self.url
            .as_deref()
            .ok_or_else(|| ConfigurationError::MissingParameter {
                connection: connection.to_string(),
                parameter: "url",
            })
    }
}
