//! SQLite connection setup

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;
use vilnius_queue::QueueError;

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:vilnius.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode so workers and producers don't block each other
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:vilnius.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    ///
    /// Every connection to `sqlite::memory:` is its own database, so the
    /// pool is held to one connection.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }

    pub fn with_url(url: &str) -> Self {
        if url.contains(":memory:") {
            return Self {
                url: url.to_string(),
                ..Self::memory()
            };
        }
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub async fn connect(&self) -> Result<SqlitePool, QueueError> {
        let mut options = SqliteConnectOptions::from_str(&self.url).map_err(QueueError::driver)?;
        options = options.pragma("busy_timeout", (self.busy_timeout_secs * 1000).to_string());
        if self.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options)
            .await
            .map_err(QueueError::driver)?;

        info!(url = %self.url, wal = self.wal_mode, "Connected to SQLite");
        Ok(pool)
    }
}
