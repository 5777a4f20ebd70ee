//! Job type registry
//!
//! Maps the stable type tag stored in every envelope to a decoder that
//! rebuilds the job from its payload.

use serde::de::DeserializeOwned;
use std::collections::HashMap;

use crate::error::DecodeError;
use crate::job::{Job, JobEnvelope, Payload, QueuedJob};

type JobFactory = Box<dyn Fn(Payload) -> Result<Box<dyn Job>, DecodeError> + Send + Sync>;

#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type rebuilt by deserializing its payload.
    ///
    /// `job_type` must match what the job returns from [`Job::job_type`].
    pub fn register<J: Job + DeserializeOwned + 'static>(&mut self, job_type: &str) -> &mut Self {
        let tag = job_type.to_string();
        let factory = move |payload: Payload| {
            let job: J = serde_json::from_value(serde_json::Value::Object(payload)).map_err(|e| {
                DecodeError::InvalidPayload {
                    job_type: tag.clone(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Box::new(job) as Box<dyn Job>)
        };
        self.factories
            .insert(job_type.to_string(), Box::new(factory));
        self
    }

    /// Register a custom factory, for jobs that cannot be rebuilt from their
    /// payload alone (injected clients, shared handles)
    pub fn register_factory<F>(&mut self, job_type: &str, factory: F) -> &mut Self
    where
        F: Fn(Payload) -> Result<Box<dyn Job>, DecodeError> + Send + Sync + 'static,
    {
        self.factories
            .insert(job_type.to_string(), Box::new(factory));
        self
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Rebuild a job from its serialized envelope
    pub fn unserialize(&self, raw: &str) -> Result<QueuedJob, DecodeError> {
        let envelope: JobEnvelope = serde_json::from_str(raw)?;
        self.decode(envelope)
    }

    pub fn decode(&self, mut envelope: JobEnvelope) -> Result<QueuedJob, DecodeError> {
        let factory = self
            .factories
            .get(&envelope.job_type)
            .ok_or_else(|| DecodeError::UnknownJobType(envelope.job_type.clone()))?;
        let job = factory(std::mem::take(&mut envelope.payload))?;
        Ok(QueuedJob::restore(envelope, job))
    }
}
