//! Failure records handed to the logging collaborator

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

/// Severity of a failure record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureLevel {
    /// The job failed and will be retried
    Error,
    /// The job failed for the last time and was deleted
    Critical,
}

impl FailureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job: String,
    pub queue: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        job: impl Into<String>,
        queue: impl Into<String>,
        attempts: u32,
        error: impl ToString,
    ) -> Self {
        Self {
            job: job.into(),
            queue: queue.into(),
            attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
        }
    }
}

/// Receives a record for every failed and every permanently failed job
#[async_trait]
pub trait FailureLog: Send + Sync {
    async fn record(&self, level: FailureLevel, record: &FailureRecord);
}

/// Emits failure records as `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureLog;

#[async_trait]
impl FailureLog for TracingFailureLog {
    async fn record(&self, level: FailureLevel, record: &FailureRecord) {
        error!(
            severity = level.as_str(),
            job = %record.job,
            queue = %record.queue,
            attempts = record.attempts,
            error = %record.error,
            "Job failed"
        );
    }
}

/// Forwards every record to each inner log in turn
#[derive(Default, Clone)]
pub struct FanoutFailureLog {
    logs: Vec<Arc<dyn FailureLog>>,
}

impl FanoutFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, log: Arc<dyn FailureLog>) -> Self {
        self.logs.push(log);
        self
    }
}

#[async_trait]
impl FailureLog for FanoutFailureLog {
    async fn record(&self, level: FailureLevel, record: &FailureRecord) {
        for log in &self.logs {
            log.record(level, record).await;
        }
    }
}

/// Keeps records in memory; handy in tests and for `failed` style listings
#[derive(Debug, Default, Clone)]
pub struct MemoryFailureLog {
    records: Arc<Mutex<Vec<(FailureLevel, FailureRecord)>>>,
}

impl MemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<(FailureLevel, FailureRecord)> {
        self.records.lock().await.clone()
    }

    pub async fn count(&self, level: FailureLevel) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }
}

#[async_trait]
impl FailureLog for MemoryFailureLog {
    async fn record(&self, level: FailureLevel, record: &FailureRecord) {
        self.records.lock().await.push((level, record.clone()));
    }
}
