//! Queue manager: resolves the configured driver and fronts it
//!
//! The manager is an ordinary value built once at startup and handed to
//! producers and workers; there is no process-global queue state.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{ConnectionConfig, QueueConfig};
use crate::driver::QueueDriver;
use crate::error::{ConfigurationError, QueueResult};
use crate::job::{Job, JobId, QueuedJob, DEFAULT_QUEUE};
use crate::memory::MemoryDriver;
use crate::registry::JobRegistry;
use crate::sync::SyncDriver;

/// Everything a driver factory gets to build a connection with
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub connection: String,
    pub config: ConnectionConfig,
    pub registry: Arc<JobRegistry>,
}

type DriverFactory =
    Arc<dyn Fn(DriverContext) -> BoxFuture<'static, QueueResult<Arc<dyn QueueDriver>>> + Send + Sync>;

pub struct QueueManager {
    config: Option<QueueConfig>,
    registry: Arc<JobRegistry>,
    factories: HashMap<String, DriverFactory>,
    driver: RwLock<Option<Arc<dyn QueueDriver>>>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut drivers: Vec<&String> = self.factories.keys().collect();
        drivers.sort();
        f.debug_struct("QueueManager")
            .field("config", &self.config)
            .field("drivers", &drivers)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Manager with the built-in `sync` and `memory` drivers registered
    pub fn new(config: Option<QueueConfig>, registry: Arc<JobRegistry>) -> Self {
        let mut manager = Self {
            config,
            registry,
            factories: HashMap::new(),
            driver: RwLock::new(None),
        };
        manager.register_driver("sync", |_ctx| async {
            Ok(Arc::new(SyncDriver::new()) as Arc<dyn QueueDriver>)
        });
        manager.register_driver("memory", |ctx| async move {
            Ok(Arc::new(MemoryDriver::new(ctx.registry)) as Arc<dyn QueueDriver>)
        });
        manager
    }

    /// Manager pinned to an explicit driver; configuration is never consulted
    pub fn with_driver(driver: Arc<dyn QueueDriver>, registry: Arc<JobRegistry>) -> Self {
        let manager = Self::new(None, registry);
        Self {
            driver: RwLock::new(Some(driver)),
            ..manager
        }
    }

    /// Make a driver available under `name` for connections to select
    pub fn register_driver<F, Fut>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(DriverContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<Arc<dyn QueueDriver>>> + Send + 'static,
    {
        self.factories.insert(
            name.to_string(),
            Arc::new(move |ctx| Box::pin(factory(ctx)) as BoxFuture<'static, _>),
        );
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> Option<&QueueConfig> {
        self.config.as_ref()
    }

    /// Replace the active driver, bypassing configuration
    pub async fn set_driver(&self, driver: Arc<dyn QueueDriver>) {
        *self.driver.write().await = Some(driver);
    }

    /// The active driver, built from configuration on first use
    pub async fn driver(&self) -> QueueResult<Arc<dyn QueueDriver>> {
        if let Some(driver) = self.driver.read().await.as_ref() {
            return Ok(driver.clone());
        }

        let mut slot = self.driver.write().await;
        if let Some(driver) = slot.as_ref() {
            return Ok(driver.clone());
        }

        let driver = match &self.config {
            Some(config) => self.connect(&config.default).await?,
            None => {
                info!("No queue configuration, using the sync driver");
                Arc::new(SyncDriver::new()) as Arc<dyn QueueDriver>
            }
        };
        *slot = Some(driver.clone());
        Ok(driver)
    }

    /// Build a fresh driver for a named connection
    pub async fn connect(&self, connection: &str) -> QueueResult<Arc<dyn QueueDriver>> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| ConfigurationError::UnknownConnection(connection.to_string()))?
            .connection(connection)?
            .clone();

        let factory = self
            .factories
            .get(&config.driver)
            .ok_or_else(|| ConfigurationError::UnknownDriver(config.driver.clone()))?;

        let driver_name = config.driver.clone();
        let driver = factory(DriverContext {
            connection: connection.to_string(),
            config,
            registry: self.registry.clone(),
        })
        .await?;

        info!(connection, driver = %driver_name, "Queue driver initialised");
        Ok(driver)
    }

    /// Queue used when a caller does not name one: the connection's `queue`
    /// parameter, else `"default"`
    pub fn default_queue(&self, connection: Option<&str>) -> String {
        self.config
            .as_ref()
            .and_then(|config| {
                let name = connection.unwrap_or(config.default.as_str());
                config.connections.get(name)
            })
            .and_then(|conn| conn.queue.clone())
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string())
    }

    /// Wrap and push a job onto `queue`
    pub async fn dispatch(&self, job: impl Job + 'static, queue: &str) -> QueueResult<JobId> {
        let mut job = QueuedJob::new(job).on_queue(queue);
        self.push(&mut job).await
    }

    pub async fn push(&self, job: &mut QueuedJob) -> QueueResult<JobId> {
        self.driver().await?.push(job).await
    }

    pub async fn later(&self, job: &mut QueuedJob, delay: Duration) -> QueueResult<JobId> {
        self.driver().await?.later(job, delay).await
    }

    pub async fn pop(&self, queue: &str) -> QueueResult<Option<QueuedJob>> {
        self.driver().await?.pop(queue).await
    }

    pub async fn acknowledge(&self, job: &QueuedJob) -> QueueResult<()> {
        self.driver().await?.acknowledge(job).await
    }

    pub async fn release(&self, job: &QueuedJob, delay: Duration) -> QueueResult<()> {
        self.driver().await?.release(job, delay).await
    }

    pub async fn delete(&self, job: &QueuedJob) -> QueueResult<()> {
        self.driver().await?.delete(job).await
    }

    pub async fn size(&self, queue: &str) -> QueueResult<u64> {
        self.driver().await?.size(queue).await
    }

    pub async fn clear(&self, queue: &str) -> QueueResult<()> {
        self.driver().await?.clear(queue).await
    }
}
