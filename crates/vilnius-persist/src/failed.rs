//! Permanently failed jobs kept in a SQLite table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use vilnius_queue::{
    ConfigurationError, FailureLevel, FailureLog, FailureRecord, QueueError, QueueResult,
};

use crate::queue::check_table;

pub const DEFAULT_FAILED_TABLE: &str = "failed_jobs";

/// Stores a row for every job that failed for the last time.
///
/// Retryable failures are not stored; they only reach the other logs.
#[derive(Debug, Clone)]
pub struct SqliteFailedJobStore {
    pool: SqlitePool,
    table: String,
}

impl SqliteFailedJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            table: DEFAULT_FAILED_TABLE.to_string(),
        }
    }

    pub fn with_table(mut self, table: &str) -> Result<Self, ConfigurationError> {
        check_table("failed_jobs", table)?;
        self.table = table.to_string();
        Ok(self)
    }

    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job TEXT NOT NULL,
                queue TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT NOT NULL,
                failed_at INTEGER NOT NULL
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(QueueError::driver)?;
        Ok(())
    }

    pub async fn insert(&self, record: &FailureRecord) -> QueueResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (job, queue, attempts, error, failed_at) VALUES (?, ?, ?, ?, ?)",
            self.table
        ))
        .bind(&record.job)
        .bind(&record.queue)
        .bind(i64::from(record.attempts))
        .bind(&record.error)
        .bind(record.failed_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(QueueError::driver)?;
        Ok(())
    }

    /// Most recent failures first
    pub async fn list(&self, limit: u32) -> QueueResult<Vec<FailureRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT job, queue, attempts, error, failed_at FROM {} ORDER BY id DESC LIMIT ?",
            self.table
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(QueueError::driver)?;

        rows.iter()
            .map(|row| {
                let attempts: i64 = row.try_get("attempts").map_err(QueueError::driver)?;
                let failed_at: i64 = row.try_get("failed_at").map_err(QueueError::driver)?;
                Ok(FailureRecord {
                    job: row.try_get("job").map_err(QueueError::driver)?,
                    queue: row.try_get("queue").map_err(QueueError::driver)?,
                    attempts: u32::try_from(attempts).unwrap_or(0),
                    error: row.try_get("error").map_err(QueueError::driver)?,
                    failed_at: DateTime::<Utc>::from_timestamp_millis(failed_at)
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Remove every stored failure, returning how many were removed
    pub async fn flush(&self) -> QueueResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await
            .map_err(QueueError::driver)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FailureLog for SqliteFailedJobStore {
    async fn record(&self, level: FailureLevel, record: &FailureRecord) {
        if level != FailureLevel::Critical {
            return;
        }
        if let Err(e) = self.insert(record).await {
            warn!(job = %record.job, error = %e, "Failed to store failed job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteConfig;

    async fn store() -> SqliteFailedJobStore {
        let pool = SqliteConfig::memory().connect().await.unwrap();
        let store = SqliteFailedJobStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_only_critical_records_are_stored() {
        let store = store().await;
        let retry = FailureRecord::new("send_email", "mail", 1, "smtp timeout");
        let last = FailureRecord::new("send_email", "mail", 3, "smtp down");

        store.record(FailureLevel::Error, &retry).await;
        store.record(FailureLevel::Critical, &last).await;

        let failed = store.list(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].error, "smtp down");
        assert_eq!(
            failed[0].failed_at.timestamp_millis(),
            last.failed_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_flush_empties() {
        let store = store().await;
        for n in 1..=3 {
            let record = FailureRecord::new(format!("job_{n}"), "default", n, "boom");
            store.insert(&record).await.unwrap();
        }

        let jobs: Vec<String> = store
            .list(2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.job)
            .collect();
        assert_eq!(jobs, vec!["job_3", "job_2"]);

        assert_eq!(store.flush().await.unwrap(), 3);
        assert!(store.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_table_name() {
        let pool = sqlx::SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        assert!(SqliteFailedJobStore::new(pool)
            .with_table("failed jobs")
            .is_err());
    }
}
