//! Error taxonomy for the queue core

use std::time::Duration;

use crate::job::JobId;

/// Boxed error a job handler may surface through [`JobError::Other`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for driver and manager operations
pub type QueueResult<T> = Result<T, QueueError>;

/// An encoded job could not be turned back into a runnable job
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),
    #[error("Malformed job envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid payload for job type {job_type}: {reason}")]
    InvalidPayload { job_type: String, reason: String },
}

/// Queue configuration is missing, unreadable or names something unknown
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Unknown queue driver: {0}")]
    UnknownDriver(String),
    #[error("Unknown queue connection: {0}")]
    UnknownConnection(String),
    #[error("Connection {connection} is missing required parameter `{parameter}`")]
    MissingParameter {
        connection: String,
        parameter: &'static str,
    },
    #[error("Connection {connection} has invalid parameter `{parameter}`: {reason}")]
    InvalidParameter {
        connection: String,
        parameter: &'static str,
        reason: String,
    },
    /// A job could outlive its reservation and be claimed by a second worker
    #[error(
        "Worker timeout {timeout:?} must be set and shorter than the {driver} driver's retry_after of {retry_after:?}"
    )]
    TimeoutNotBelowReservation {
        driver: String,
        timeout: Duration,
        retry_after: Duration,
    },
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Error raised from inside a job's `handle`
///
/// These are recovered by the worker and drive the retry/delete decision.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Ordinary failure, retried while attempts remain
    #[error("{0}")]
    Failed(String),
    /// The job asked not to be retried
    #[error("{0}")]
    Fatal(String),
    #[error("Job exceeded its timeout of {0:?}")]
    Timeout(Duration),
    #[error("Job panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] BoxError),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the retry policy may schedule another attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Errors surfaced by drivers and the queue manager
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backing store or broker failed. Not recovered by the worker.
    #[error("Driver error: {0}")]
    Driver(String),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    /// A popped record could not be decoded and was taken out of circulation
    #[error("Job {id} could not be decoded: {source}")]
    Undecodable {
        id: JobId,
        #[source]
        source: DecodeError,
    },
    /// A reclaimed job used up its attempts without finishing and was removed
    #[error("Job {id} ({job_type}) was abandoned after {attempts} attempt(s)")]
    AttemptsExhausted {
        id: JobId,
        job_type: String,
        queue: String,
        attempts: u32,
    },
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A job executed inline by the sync driver failed
    #[error("Job execution failed: {0}")]
    Execution(#[from] JobError),
}

impl QueueError {
    pub fn driver(err: impl std::fmt::Display) -> Self {
        Self::Driver(err.to_string())
    }
}
