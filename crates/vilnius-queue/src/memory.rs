//! In-memory driver with durable-queue semantics
//!
//! Jobs are held in their serialized form, ready jobs are ordered by ready
//! time and then push order, and popped jobs stay stored (and counted by
//! `size`) until they are acknowledged, released or deleted.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::driver::QueueDriver;
use crate::error::{QueueError, QueueResult};
use crate::job::{JobId, QueuedJob};
use crate::registry::JobRegistry;

/// Heap entry - earliest ready time first, then push order
#[derive(Debug, Clone, Eq, PartialEq)]
struct ReadyEntry {
    ready_at: Instant,
    seq: u64,
    id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: BinaryHeap is a max-heap
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct StoredJob {
    queue: String,
    raw: String,
    /// Sequence of the live heap entry; stale entries carry an older one
    seq: u64,
}

/// Counters kept by the memory driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub pushed: u64,
    pub acknowledged: u64,
    pub released: u64,
    pub deleted: u64,
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, StoredJob>,
    ready: HashMap<String, BinaryHeap<ReadyEntry>>,
    reserved: HashSet<JobId>,
    next_seq: u64,
    stats: MemoryStats,
}

impl State {
    fn store(&mut self, id: JobId, queue: &str, raw: String, ready_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.reserved.remove(&id);
        self.jobs.insert(
            id.clone(),
            StoredJob {
                queue: queue.to_string(),
                raw,
                seq,
            },
        );
        self.ready
            .entry(queue.to_string())
            .or_default()
            .push(ReadyEntry { ready_at, seq, id });
    }

    fn remove(&mut self, id: &JobId) -> bool {
        self.reserved.remove(id);
        self.jobs.remove(id).is_some()
    }
}

#[derive(Debug)]
pub struct MemoryDriver {
    registry: Arc<JobRegistry>,
    state: Mutex<State>,
}

impl MemoryDriver {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(State::default()),
        }
    }

    pub async fn stats(&self) -> MemoryStats {
        self.state.lock().await.stats
    }

    /// Store an already serialized envelope as-is
    pub async fn push_raw(&self, queue: &str, raw: impl Into<String>) -> JobId {
        let id = JobId::generate();
        let mut state = self.state.lock().await;
        state.store(id.clone(), queue, raw.into(), Instant::now());
        state.stats.pushed += 1;
        id
    }

    async fn store(&self, job: &mut QueuedJob, delay: Duration) -> QueueResult<JobId> {
        let id = JobId::generate();
        job.assign_id(id.clone());
        let raw = job.serialize()?;

        let mut state = self.state.lock().await;
        state.store(id.clone(), job.queue(), raw, Instant::now() + delay);
        state.stats.pushed += 1;
        Ok(id)
    }

    fn stored_id(job: &QueuedJob) -> Option<&JobId> {
        let id = job.id();
        if id.is_none() {
            warn!(job = job.job_type(), "Job without an id was never pushed");
        }
        id
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, job: &mut QueuedJob) -> QueueResult<JobId> {
        self.store(job, Duration::ZERO).await
    }

    async fn later(&self, job: &mut QueuedJob, delay: Duration) -> QueueResult<JobId> {
        self.store(job, delay).await
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<QueuedJob>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();

        let Some(heap) = state.ready.get_mut(queue) else {
            return Ok(None);
        };

        let entry = loop {
            let Some(top) = heap.peek() else {
                return Ok(None);
            };
            let live = state
                .jobs
                .get(&top.id)
                .is_some_and(|stored| stored.seq == top.seq);
            if !live {
                heap.pop();
                continue;
            }
            if top.ready_at > now {
                return Ok(None);
            }
            match heap.pop() {
                Some(entry) => break entry,
                None => return Ok(None),
            }
        };

        let Some(stored) = state.jobs.get(&entry.id) else {
            return Ok(None);
        };

        match self.registry.unserialize(&stored.raw) {
            Ok(mut job) => {
                job.assign_id(entry.id.clone());
                state.reserved.insert(entry.id);
                Ok(Some(job))
            }
            Err(source) => {
                state.jobs.remove(&entry.id);
                state.stats.discarded += 1;
                Err(QueueError::Undecodable {
                    id: entry.id,
                    source,
                })
            }
        }
    }

    async fn acknowledge(&self, job: &QueuedJob) -> QueueResult<()> {
        let Some(id) = Self::stored_id(job) else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        if state.remove(id) {
            state.stats.acknowledged += 1;
        }
        Ok(())
    }

    async fn release(&self, job: &QueuedJob, delay: Duration) -> QueueResult<()> {
        let Some(id) = Self::stored_id(job) else {
            return Ok(());
        };
        let raw = job.serialize()?;

        let mut state = self.state.lock().await;
        state.store(id.clone(), job.queue(), raw, Instant::now() + delay);
        state.stats.released += 1;

        debug!(
            job_id = %id,
            attempts = job.attempts(),
            delay_secs = delay.as_secs(),
            "Re-queuing job with backoff"
        );
        Ok(())
    }

    async fn delete(&self, job: &QueuedJob) -> QueueResult<()> {
        let Some(id) = Self::stored_id(job) else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        if state.remove(id) {
            state.stats.deleted += 1;
        }
        Ok(())
    }

    async fn size(&self, queue: &str) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok(state.jobs.values().filter(|job| job.queue == queue).count() as u64)
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.jobs.retain(|_, job| job.queue != queue);
        state.ready.remove(queue);
        let jobs = &state.jobs;
        state.reserved.retain(|id| jobs.contains_key(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::job::{to_payload, Job, Payload};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Tagged {
        tag: String,
    }

    #[async_trait]
    impl Job for Tagged {
        fn job_type(&self) -> &str {
            "tagged"
        }

        async fn handle(&mut self) -> Result<(), JobError> {
            Ok(())
        }

        fn payload(&self) -> Result<Payload, serde_json::Error> {
            to_payload(self)
        }
    }

    fn driver() -> MemoryDriver {
        let mut registry = JobRegistry::new();
        registry.register::<Tagged>("tagged");
        MemoryDriver::new(Arc::new(registry))
    }

    fn tagged(tag: &str) -> QueuedJob {
        QueuedJob::new(Tagged { tag: tag.into() })
    }

    fn tag_of(job: &QueuedJob) -> String {
        job.envelope().unwrap().payload["tag"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let driver = driver();
        for tag in ["a", "b", "c"] {
            driver.push(&mut tagged(tag)).await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(job) = driver.pop("default").await.unwrap() {
            seen.push(tag_of(&job));
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let driver = driver();
        driver
            .push(&mut tagged("mail").on_queue("emails"))
            .await
            .unwrap();

        assert!(driver.pop("default").await.unwrap().is_none());
        assert_eq!(driver.size("emails").await.unwrap(), 1);
        assert_eq!(driver.size("default").await.unwrap(), 0);
        let job = driver.pop("emails").await.unwrap().unwrap();
        assert_eq!(job.queue(), "emails");
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_job_waits_for_its_delay() {
        let driver = driver();
        driver.push(&mut tagged("a")).await.unwrap();

        let mut job = driver.pop("default").await.unwrap().unwrap();
        job.record_failed_attempt();
        driver
            .release(&job, Duration::from_secs(20))
            .await
            .unwrap();

        assert!(driver.pop("default").await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(19)).await;
        assert!(driver.pop("default").await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(1)).await;

        let again = driver.pop("default").await.unwrap().unwrap();
        assert_eq!(again.id(), job.id());
        assert_eq!(again.attempts(), 1);
        assert_eq!(driver.stats().await.released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_jobs_are_not_held_up_by_delayed_ones() {
        let driver = driver();
        driver
            .later(&mut tagged("late"), Duration::from_secs(60))
            .await
            .unwrap();
        driver.push(&mut tagged("now")).await.unwrap();

        let job = driver.pop("default").await.unwrap().unwrap();
        assert_eq!(tag_of(&job), "now");
        assert!(driver.pop("default").await.unwrap().is_none());
        assert_eq!(driver.size("default").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_size_counts_reserved_jobs() {
        let driver = driver();
        for n in 0..5 {
            driver.push(&mut tagged(&n.to_string())).await.unwrap();
        }
        let first = driver.pop("default").await.unwrap().unwrap();
        let _second = driver.pop("default").await.unwrap().unwrap();
        assert_eq!(driver.size("default").await.unwrap(), 5);

        driver.acknowledge(&first).await.unwrap();
        assert_eq!(driver.size("default").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let driver = driver();
        driver.push(&mut tagged("a")).await.unwrap();
        let job = driver.pop("default").await.unwrap().unwrap();

        driver.acknowledge(&job).await.unwrap();
        driver.acknowledge(&job).await.unwrap();

        assert_eq!(driver.stats().await.acknowledged, 1);
        assert_eq!(driver.size("default").await.unwrap(), 0);
        assert!(driver.pop("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_ready_job_skips_stale_entry() {
        let driver = driver();
        let mut a = tagged("a");
        driver.push(&mut a).await.unwrap();
        driver.push(&mut tagged("b")).await.unwrap();

        driver.delete(&a).await.unwrap();
        let job = driver.pop("default").await.unwrap().unwrap();
        assert_eq!(tag_of(&job), "b");
        assert_eq!(driver.stats().await.deleted, 1);
    }

    #[tokio::test]
    async fn test_clear_removes_only_that_queue() {
        let driver = driver();
        driver.push(&mut tagged("a")).await.unwrap();
        driver
            .push(&mut tagged("b").on_queue("other"))
            .await
            .unwrap();

        driver.clear("default").await.unwrap();
        assert_eq!(driver.size("default").await.unwrap(), 0);
        assert_eq!(driver.size("other").await.unwrap(), 1);
        assert!(driver.pop("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_job_is_discarded() {
        let driver = driver();
        let id = driver.push_raw("default", "{broken").await;

        let err = driver.pop("default").await.unwrap_err();
        assert!(matches!(err, QueueError::Undecodable { id: ref bad, .. } if *bad == id));
        assert_eq!(driver.size("default").await.unwrap(), 0);
        assert!(driver.pop("default").await.unwrap().is_none());
    }
}
