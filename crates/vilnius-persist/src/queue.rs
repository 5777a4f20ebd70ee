//! Durable queue driver backed by a SQLite table

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use vilnius_queue::job::JobEnvelope;
use vilnius_queue::{
    ConfigurationError, DecodeError, DriverContext, JobId, JobRegistry, QueueDriver, QueueError,
    QueueManager, QueueResult, QueuedJob,
};

use crate::sqlite::SqliteConfig;

pub const DEFAULT_TABLE: &str = "jobs";

/// Reserved jobs not finished within this window are handed out again
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(90);

/// Table names are interpolated into SQL, so only plain identifiers pass
fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn check_table(connection: &str, table: &str) -> Result<(), ConfigurationError> {
    if is_valid_table_name(table) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidParameter {
            connection: connection.to_string(),
            parameter: "table",
            reason: format!("`{table}` is not a plain SQL identifier"),
        })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Durable queue driver using SQLite
///
/// Pop claims a row with a single `UPDATE ... RETURNING`, so several worker
/// processes can share one database without handing a job out twice.
///
/// The `attempts` column is authoritative over the count in the stored
/// envelope. Claiming a row whose reservation lapsed counts as a failed
/// attempt, since the worker holding it died or hung.
#[derive(Debug)]
pub struct DatabaseDriver {
    pool: SqlitePool,
    table: String,
    retry_after: Duration,
    registry: Arc<JobRegistry>,
}

impl DatabaseDriver {
    pub fn new(pool: SqlitePool, registry: Arc<JobRegistry>) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
            retry_after: DEFAULT_RETRY_AFTER,
            registry,
        }
    }

    pub fn with_table(mut self, table: &str) -> Result<Self, ConfigurationError> {
        check_table("database", table)?;
        self.table = table.to_string();
        Ok(self)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    /// Build a migrated driver from a `database` connection entry
    pub async fn from_context(ctx: DriverContext) -> QueueResult<Self> {
        let url = ctx.config.require_url(&ctx.connection)?;
        let mut sqlite = SqliteConfig::with_url(url);
        if let Some(max) = ctx.config.max_connections {
            sqlite.max_connections = max;
        }

        let table = ctx.config.table.as_deref().unwrap_or(DEFAULT_TABLE).to_string();
        check_table(&ctx.connection, &table)?;

        let pool = sqlite.connect().await?;
        let mut driver = Self::new(pool, ctx.registry).with_table(&table)?;
        if let Some(secs) = ctx.config.retry_after {
            driver = driver.with_retry_after(Duration::from_secs(secs));
        }
        driver.migrate().await?;
        Ok(driver)
    }

    /// Create the jobs table if it does not exist
    pub async fn migrate(&self) -> QueueResult<()> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                reserved_at INTEGER,
                available_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(QueueError::driver)?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_queue_available ON {table} (queue, available_at)"
        ))
        .execute(&self.pool)
        .await
        .map_err(QueueError::driver)?;

        Ok(())
    }

    async fn insert(&self, job: &mut QueuedJob, delay: Duration) -> QueueResult<JobId> {
        let id = JobId::generate();
        job.assign_id(id.clone());
        let payload = job.serialize()?;
        let now = now_millis();

        sqlx::query(&format!(
            "INSERT INTO {} (id, queue, payload, attempts, available_at, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            self.table
        ))
        .bind(id.as_str())
        .bind(job.queue())
        .bind(payload)
        .bind(i64::from(job.attempts()))
        .bind(now.saturating_add(millis(delay)))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(QueueError::driver)?;

        Ok(id)
    }

    async fn remove(&self, job: &QueuedJob) -> QueueResult<()> {
        match job.id() {
            Some(id) => self.delete_row(id).await,
            None => Ok(()),
        }
    }

    async fn delete_row(&self, id: &JobId) -> QueueResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.table))
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(QueueError::driver)?;
        Ok(())
    }

    fn decode(&self, payload: &str, attempts: u32) -> Result<QueuedJob, DecodeError> {
        let mut envelope: JobEnvelope = serde_json::from_str(payload)?;
        if attempts > envelope.attempts {
            warn!(
                job = %envelope.job_type,
                attempts,
                "Reclaimed job whose reservation expired"
            );
        }
        envelope.attempts = attempts;
        self.registry.decode(envelope)
    }
}

/// Register the `database` driver with a manager
pub fn register_database_driver(manager: &mut QueueManager) {
    manager.register_driver("database", |ctx| async move {
        let driver = DatabaseDriver::from_context(ctx).await?;
        Ok(Arc::new(driver) as Arc<dyn QueueDriver>)
    });
}

#[async_trait]
impl QueueDriver for DatabaseDriver {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn push(&self, job: &mut QueuedJob) -> QueueResult<JobId> {
        self.insert(job, Duration::ZERO).await
    }

    async fn later(&self, job: &mut QueuedJob, delay: Duration) -> QueueResult<JobId> {
        self.insert(job, delay).await
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<QueuedJob>> {
        let now = now_millis();
        let stale_before = now.saturating_sub(millis(self.retry_after));
        let table = &self.table;

        let row = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET reserved_at = ?1,
                attempts = attempts + (CASE WHEN reserved_at IS NULL THEN 0 ELSE 1 END)
            WHERE sequence = (
                SELECT sequence FROM {table}
                WHERE queue = ?2
                  AND available_at <= ?1
                  AND (reserved_at IS NULL OR reserved_at <= ?3)
                ORDER BY available_at ASC, sequence ASC
                LIMIT 1
            )
            RETURNING id, payload, attempts
            "#
        ))
        .bind(now)
        .bind(queue)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(QueueError::driver)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(QueueError::driver)?;
        let payload: String = row.try_get("payload").map_err(QueueError::driver)?;
        let attempts: i64 = row.try_get("attempts").map_err(QueueError::driver)?;
        let id = JobId::new(id);
        let attempts = u32::try_from(attempts).unwrap_or(0);

        let mut job = match self.decode(&payload, attempts) {
            Ok(job) => job,
            Err(source) => {
                error!(job_id = %id, error = %source, "Removing job that cannot be decoded");
                self.delete_row(&id).await?;
                return Err(QueueError::Undecodable { id, source });
            }
        };
        job.assign_id(id.clone());

        if job.max_attempts_exceeded() {
            error!(
                job_id = %id,
                attempts,
                max_attempts = job.max_attempts(),
                "Removing reclaimed job that has no attempts left"
            );
            self.delete_row(&id).await?;
            return Err(QueueError::AttemptsExhausted {
                id,
                job_type: job.job_type().to_string(),
                queue: job.queue().to_string(),
                attempts,
            });
        }

        Ok(Some(job))
    }

    async fn acknowledge(&self, job: &QueuedJob) -> QueueResult<()> {
        self.remove(job).await
    }

    async fn release(&self, job: &QueuedJob, delay: Duration) -> QueueResult<()> {
        let Some(id) = job.id() else {
            return Ok(());
        };
        let payload = job.serialize()?;
        let now = now_millis();

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, queue, payload, attempts, reserved_at, available_at, created_at)
            VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                attempts = excluded.attempts,
                reserved_at = NULL,
                available_at = excluded.available_at
            "#,
            table = self.table
        ))
        .bind(id.as_str())
        .bind(job.queue())
        .bind(payload)
        .bind(i64::from(job.attempts()))
        .bind(now.saturating_add(millis(delay)))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(QueueError::driver)?;

        debug!(
            job_id = %id,
            attempts = job.attempts(),
            delay_secs = delay.as_secs(),
            "Re-queuing job with backoff"
        );
        Ok(())
    }

    async fn delete(&self, job: &QueuedJob) -> QueueResult<()> {
        self.remove(job).await
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE queue = ?",
            self.table
        ))
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(QueueError::driver)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE queue = ?", self.table))
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(QueueError::driver)?;
        Ok(())
    }

    fn reservation_timeout(&self) -> Option<Duration> {
        Some(self.retry_after)
    }
}
