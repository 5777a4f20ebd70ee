//! Settings and queue handles shared by every command

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use vilnius_persist::{register_database_driver, SqliteConfig, SqliteFailedJobStore};
use vilnius_queue::{ConnectionConfig, JobRegistry, QueueDriver, QueueManager, Settings};

use crate::jobs;

pub struct AppContext {
    settings: Settings,
    registry: Arc<JobRegistry>,
}

impl AppContext {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = Settings::load(path).context("Failed to load configuration")?;
        debug!(configured = settings.queue.is_some(), "Settings loaded");
        Ok(Self {
            settings,
            registry: Arc::new(jobs::registry()),
        })
    }

    /// Manager with every driver this binary knows about
    pub fn manager(&self) -> QueueManager {
        let mut manager = QueueManager::new(self.settings.queue.clone(), self.registry.clone());
        register_database_driver(&mut manager);
        manager
    }

    /// Driver for the named connection, or the configured default
    pub async fn driver(
        &self,
        manager: &QueueManager,
        connection: Option<&str>,
    ) -> Result<Arc<dyn QueueDriver>> {
        let driver = match connection {
            Some(name) => manager.connect(name).await,
            None => manager.driver().await,
        };
        driver.context("Failed to open queue connection")
    }

    fn connection_config<'a>(&'a self, connection: Option<&'a str>) -> Option<(&'a str, &'a ConnectionConfig)> {
        let config = self.settings.queue.as_ref()?;
        let name = connection.unwrap_or(config.default.as_str());
        config.connections.get(name).map(|conn| (name, conn))
    }

    /// Failed-job store living next to a `database` connection's jobs table
    pub async fn failed_store(&self, connection: Option<&str>) -> Result<Option<SqliteFailedJobStore>> {
        let Some((name, conn)) = self.connection_config(connection) else {
            return Ok(None);
        };
        if conn.driver != "database" {
            return Ok(None);
        }

        let url = conn.require_url(name)?;
        let pool = SqliteConfig::with_url(url)
            .connect()
            .await
            .context("Failed to open failed-job store")?;
        let store = SqliteFailedJobStore::new(pool);
        store.migrate().await?;
        Ok(Some(store))
    }
}
