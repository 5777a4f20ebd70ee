//! Job definitions

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{JobError, QueueError};

/// Queue used when a job does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Attempts allowed when a job type does not override [`Job::max_attempts`]
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Key-value data a job is rebuilt from after a round trip through a driver
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Opaque job identifier, assigned by the driver at push time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A unit of deferred work
#[async_trait::async_trait]
pub trait Job: Send + Sync + Debug {
    /// Stable type tag, the key the job is registered under in a
    /// [`JobRegistry`](crate::registry::JobRegistry)
    fn job_type(&self) -> &str;

    /// Execute the job. Errors propagate to the worker untouched.
    async fn handle(&mut self) -> Result<(), JobError>;

    /// Data needed to rebuild this job. Most jobs return `to_payload(self)`.
    fn payload(&self) -> Result<Payload, serde_json::Error>;

    /// Total executions allowed, first attempt included
    fn max_attempts(&self) -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }

    /// Backoff strategy
    fn backoff_strategy(&self) -> BackoffStrategy {
        BackoffStrategy::default()
    }
}

/// Serialize a job into its payload map. Anything that is not a map is rejected.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload, serde_json::Error> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "job payload must serialize to a map, got {other}"
        ))),
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant {
        secs: u64,
    },
    Exponential {
        initial_secs: u64,
        multiplier: f64,
        max_secs: u64,
    },
}

impl Default for BackoffStrategy {
    /// `min(2^attempts * 10, 300)` seconds
    fn default() -> Self {
        Self::Exponential {
            initial_secs: 10,
            multiplier: 2.0,
            max_secs: 300,
        }
    }
}

impl BackoffStrategy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { secs } => Duration::from_secs(*secs),
            Self::Exponential {
                initial_secs,
                multiplier,
                max_secs,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                // float to int casts saturate, so huge exponents land on the cap
                let secs = (*initial_secs as f64 * multiplier.powi(exponent)) as u64;
                Duration::from_secs(secs.min(*max_secs))
            }
        }
    }
}

/// Serialized form of a queued job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "job")]
    pub job_type: String,
    pub id: Option<JobId>,
    pub queue: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub payload: Payload,
}

/// A job together with its queue bookkeeping
#[derive(Debug)]
pub struct QueuedJob {
    id: Option<JobId>,
    queue: String,
    attempts: u32,
    max_attempts: u32,
    job: Box<dyn Job>,
}

impl QueuedJob {
    pub fn new(job: impl Job + 'static) -> Self {
        Self::from_boxed(Box::new(job))
    }

    pub fn from_boxed(job: Box<dyn Job>) -> Self {
        let max_attempts = job.max_attempts().max(1);
        Self {
            id: None,
            queue: DEFAULT_QUEUE.to_string(),
            attempts: 0,
            max_attempts,
            job,
        }
    }

    /// Rebuild a job read back from a driver
    pub(crate) fn restore(envelope: JobEnvelope, job: Box<dyn Job>) -> Self {
        Self {
            id: envelope.id,
            queue: envelope.queue,
            attempts: envelope.attempts,
            max_attempts: envelope.max_attempts.max(1),
            job,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn id(&self) -> Option<&JobId> {
        self.id.as_ref()
    }

    /// Called by drivers when the job is stored
    pub fn assign_id(&mut self, id: JobId) {
        self.id = Some(id);
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn job_type(&self) -> &str {
        self.job.job_type()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_strategy(&self) -> BackoffStrategy {
        self.job.backoff_strategy()
    }

    /// Count one failed execution. Attempts never decrease.
    pub fn record_failed_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn max_attempts_exceeded(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub async fn handle(&mut self) -> Result<(), JobError> {
        self.job.handle().await
    }

    pub fn envelope(&self) -> Result<JobEnvelope, serde_json::Error> {
        Ok(JobEnvelope {
            job_type: self.job.job_type().to_string(),
            id: self.id.clone(),
            queue: self.queue.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            payload: self.job.payload()?,
        })
    }

    pub fn serialize(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(&self.envelope()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize)]
    struct Noop {
        n: u32,
    }

    #[async_trait::async_trait]
    impl Job for Noop {
        fn job_type(&self) -> &str {
            "noop"
        }

        async fn handle(&mut self) -> Result<(), JobError> {
            Ok(())
        }

        fn payload(&self) -> Result<Payload, serde_json::Error> {
            to_payload(self)
        }
    }

    #[test]
    fn test_default_backoff_table() {
        let backoff = BackoffStrategy::default();
        assert_eq!(backoff.delay(0).as_secs(), 10);
        assert_eq!(backoff.delay(1).as_secs(), 20);
        assert_eq!(backoff.delay(2).as_secs(), 40);
        assert_eq!(backoff.delay(3).as_secs(), 80);
        assert_eq!(backoff.delay(4).as_secs(), 160);
        assert_eq!(backoff.delay(5).as_secs(), 300);
        assert_eq!(backoff.delay(6).as_secs(), 300);
        assert_eq!(backoff.delay(u32::MAX).as_secs(), 300);
    }

    #[test]
    fn test_max_attempts_boundary() {
        let mut job = QueuedJob::new(Noop { n: 1 });
        assert_eq!(job.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert!(!job.max_attempts_exceeded());

        job.record_failed_attempt();
        job.record_failed_attempt();
        assert!(!job.max_attempts_exceeded());

        assert_eq!(job.record_failed_attempt(), 3);
        assert!(job.max_attempts_exceeded());
    }

    #[test]
    fn test_to_payload_rejects_non_maps() {
        assert!(to_payload(&42).is_err());
        let map = to_payload(&Noop { n: 7 }).unwrap();
        assert_eq!(map["n"], 7);
    }

    #[test]
    fn test_envelope_carries_queue_bookkeeping() {
        let mut job = QueuedJob::new(Noop { n: 2 }).on_queue("emails");
        job.assign_id(JobId::new("abc"));
        job.record_failed_attempt();

        let envelope = job.envelope().unwrap();
        assert_eq!(envelope.job_type, "noop");
        assert_eq!(envelope.id, Some(JobId::new("abc")));
        assert_eq!(envelope.queue, "emails");
        assert_eq!(envelope.attempts, 1);
        assert_eq!(envelope.max_attempts, 3);

        let raw = job.serialize().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["job"], "noop");
        assert_eq!(value["payload"]["n"], 2);
    }
}
