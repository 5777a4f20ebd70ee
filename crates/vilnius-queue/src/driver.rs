//! Queue driver trait

use async_trait::async_trait;
use std::time::Duration;

use crate::error::QueueResult;
use crate::job::{JobId, QueuedJob};

/// Pluggable job storage.
///
/// A driver owns its named queues and is the only authority on whether a
/// job is stored and when it becomes visible. Every operation is scoped to
/// a queue name; jobs carry their own queue.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Name this driver is configured under
    fn name(&self) -> &'static str;

    /// Store a job and hand back the id assigned to it
    async fn push(&self, job: &mut QueuedJob) -> QueueResult<JobId>;

    /// Store a job that becomes ready no earlier than `delay` from now
    async fn later(&self, job: &mut QueuedJob, delay: Duration) -> QueueResult<JobId>;

    /// Take the next ready job, FIFO among ready jobs. Never blocks.
    async fn pop(&self, queue: &str) -> QueueResult<Option<QueuedJob>>;

    /// Remove a successfully completed job. Unknown jobs are ignored.
    async fn acknowledge(&self, job: &QueuedJob) -> QueueResult<()>;

    /// Put a job back, ready again after `delay`. Stores the job's current
    /// attempt count as-is.
    async fn release(&self, job: &QueuedJob, delay: Duration) -> QueueResult<()>;

    /// Remove a job permanently, whatever state it is in
    async fn delete(&self, job: &QueuedJob) -> QueueResult<()>;

    /// Jobs stored for `queue`, ready, delayed and reserved alike
    async fn size(&self, queue: &str) -> QueueResult<u64>;

    /// Remove every job stored for `queue`
    async fn clear(&self, queue: &str) -> QueueResult<()>;

    /// How long a popped job stays reserved before another pop may claim it
    /// again. `None` when reservations never expire.
    fn reservation_timeout(&self) -> Option<Duration> {
        None
    }
}
