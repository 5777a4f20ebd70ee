//! Jobs this binary can push and run

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use vilnius_queue::{to_payload, Job, JobError, JobRegistry, Payload};

/// Writes its message to the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessageJob {
    pub message: String,
}

#[async_trait]
impl Job for LogMessageJob {
    fn job_type(&self) -> &str {
        "log_message"
    }

    async fn handle(&mut self) -> Result<(), JobError> {
        info!(message = %self.message, "log_message");
        println!("{}", self.message);
        Ok(())
    }

    fn payload(&self) -> Result<Payload, serde_json::Error> {
        to_payload(self)
    }
}

pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register::<LogMessageJob>("log_message");
    registry
}
