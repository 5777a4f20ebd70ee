//! Synchronous driver: runs jobs inside `push`, stores nothing

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::driver::QueueDriver;
use crate::error::{QueueError, QueueResult};
use crate::job::{JobId, QueuedJob};

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncDriver;

impl SyncDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueueDriver for SyncDriver {
    fn name(&self) -> &'static str {
        "sync"
    }

    async fn push(&self, job: &mut QueuedJob) -> QueueResult<JobId> {
        let id = JobId::generate();
        job.assign_id(id.clone());

        debug!(job_id = %id, job = job.job_type(), queue = job.queue(), "Running job inline");
        job.handle().await.map_err(QueueError::Execution)?;

        Ok(id)
    }

    /// There is nowhere to park a delayed job, so it runs now
    async fn later(&self, job: &mut QueuedJob, _delay: Duration) -> QueueResult<JobId> {
        self.push(job).await
    }

    async fn pop(&self, _queue: &str) -> QueueResult<Option<QueuedJob>> {
        Ok(None)
    }

    async fn acknowledge(&self, _job: &QueuedJob) -> QueueResult<()> {
        Ok(())
    }

    async fn release(&self, _job: &QueuedJob, _delay: Duration) -> QueueResult<()> {
        Ok(())
    }

    async fn delete(&self, _job: &QueuedJob) -> QueueResult<()> {
        Ok(())
    }

    async fn size(&self, _queue: &str) -> QueueResult<u64> {
        Ok(0)
    }

    async fn clear(&self, _queue: &str) -> QueueResult<()> {
        Ok(())
    }
}
