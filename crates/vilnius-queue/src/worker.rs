//! Worker loop: pop, execute, acknowledge or retry
//!
//! One job runs at a time. Stopping is cooperative: a stop request is
//! noticed at the top of the next iteration (or cuts an idle sleep short)
//! and never interrupts a job in flight.

use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::driver::QueueDriver;
use crate::error::{ConfigurationError, DecodeError, JobError, QueueError, QueueResult};
use crate::failure::{FailureLevel, FailureLog, FailureRecord, TracingFailureLog};
use crate::job::QueuedJob;
use crate::retry::{self, RetryDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Stop after this many jobs; 0 means no limit
    pub max_jobs: u64,
    /// Stop once resident memory reaches this many megabytes
    pub memory_limit_mb: u64,
    /// Per-job time limit; zero disables it.
    ///
    /// The limit is enforced by dropping the job's future, so it only takes
    /// effect at an `.await`. A handler that blocks the thread is not
    /// preempted; run workers under a supervisor with a hard watchdog.
    ///
    /// Drivers whose reservations expire require a non-zero timeout below
    /// their reservation window.
    pub timeout: Duration,
    /// Pause between polls of an empty queue
    pub sleep: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 0,
            memory_limit_mb: 128,
            timeout: Duration::from_secs(60),
            sleep: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxJobs,
    MemoryLimit,
    Requested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxJobs => f.write_str("job limit reached"),
            Self::MemoryLimit => f.write_str("memory limit reached"),
            Self::Requested => f.write_str("stop requested"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: u64,
    pub reason: StopReason,
}

/// Progress notifications, e.g. for console output
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Processing {
        id: String,
        job: String,
    },
    Completed {
        id: String,
        job: String,
    },
    Failed {
        id: String,
        job: String,
        attempts: u32,
        error: String,
    },
    Released {
        id: String,
        job: String,
        delay: Duration,
    },
    Deleted {
        id: String,
        job: String,
        attempts: u32,
    },
    Discarded {
        id: String,
        error: String,
    },
    Stopping {
        reason: StopReason,
    },
}

pub trait WorkerObserver: Send + Sync {
    fn on_event(&self, event: &WorkerEvent);
}

/// Outcome of a single execution
#[derive(Debug)]
pub enum JobOutcome {
    Success,
    Failure(JobError),
}

/// Cloneable handle that asks a worker to stop
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Stop the worker on SIGINT or SIGTERM
pub fn listen_for_signals(handle: StopHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, stopping after the current job"),
            _ = terminate => info!("Received SIGTERM, stopping after the current job"),
        }
        handle.stop();
    })
}

/// Current resident set size of this process
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    use nix::unistd::{sysconf, SysconfVar};

    // second field of statm is resident pages
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = u64::try_from(sysconf(SysconfVar::PAGE_SIZE).ok()??).ok()?;
    Some(pages.saturating_mul(page_size))
}

/// Resident set size of this process.
///
/// Outside Linux only the peak is available, so a past spike keeps
/// counting against the limit.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn resident_memory_bytes() -> Option<u64> {
    use nix::sys::resource::{getrusage, UsageWho};

    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let max_rss = u64::try_from(usage.max_rss()).ok()?;
    // macOS reports bytes, the BSDs kilobytes
    if cfg!(target_os = "macos") {
        Some(max_rss)
    } else {
        Some(max_rss * 1024)
    }
}

#[cfg(not(unix))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}

pub struct Worker {
    driver: Arc<dyn QueueDriver>,
    queue: String,
    config: WorkerConfig,
    failures: Arc<dyn FailureLog>,
    observer: Option<Arc<dyn WorkerObserver>>,
    memory_probe: fn() -> Option<u64>,
    stop: StopHandle,
    state: WorkerState,
    processed: u64,
}

impl Worker {
    pub fn new(driver: Arc<dyn QueueDriver>, queue: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            driver,
            queue: queue.into(),
            config,
            failures: Arc::new(TracingFailureLog),
            observer: None,
            memory_probe: resident_memory_bytes,
            stop: StopHandle::new(),
            state: WorkerState::Running,
            processed: 0,
        }
    }

    pub fn with_failure_log(mut self, failures: Arc<dyn FailureLog>) -> Self {
        self.failures = failures;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_memory_probe(mut self, probe: fn() -> Option<u64>) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Run until a stop condition is met.
    ///
    /// Job failures are handled here; driver errors are not and end the
    /// run with `Err`.
    pub async fn run(&mut self) -> QueueResult<WorkerReport> {
        self.check_timeout().map_err(|e| self.abort(e.into()))?;

        info!(
            queue = %self.queue,
            driver = self.driver.name(),
            max_jobs = self.config.max_jobs,
            "Worker started"
        );

        let reason = loop {
            if self.memory_exceeded() {
                break StopReason::MemoryLimit;
            }
            if self.config.max_jobs > 0 && self.processed >= self.config.max_jobs {
                break StopReason::MaxJobs;
            }
            if self.stop.is_stopping() {
                break StopReason::Requested;
            }

            match self.driver.pop(&self.queue).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process(job).await {
                        return Err(self.abort(e));
                    }
                }
                Ok(None) => self.idle().await,
                Err(QueueError::Undecodable { id, source }) => {
                    self.discard(id.to_string(), source).await;
                }
                Err(err @ QueueError::AttemptsExhausted { .. }) => self.abandon(err).await,
                Err(e) => return Err(self.abort(e)),
            }
        };

        self.state = WorkerState::Stopping;
        info!(queue = %self.queue, processed = self.processed, reason = %reason, "Worker stopping");
        self.emit(WorkerEvent::Stopping { reason });

        Ok(WorkerReport {
            processed: self.processed,
            reason,
        })
    }

    fn abort(&mut self, e: QueueError) -> QueueError {
        self.state = WorkerState::Stopping;
        error!(queue = %self.queue, error = %e, "Queue error, worker exiting");
        e
    }

    /// A job still running when its reservation lapses gets handed to a
    /// second worker, so the timeout has to end it first
    fn check_timeout(&self) -> Result<(), ConfigurationError> {
        let Some(retry_after) = self.driver.reservation_timeout() else {
            return Ok(());
        };
        let timeout = self.config.timeout;
        if timeout.is_zero() || timeout >= retry_after {
            return Err(ConfigurationError::TimeoutNotBelowReservation {
                driver: self.driver.name().to_string(),
                timeout,
                retry_after,
            });
        }
        Ok(())
    }

    fn memory_exceeded(&self) -> bool {
        let limit = self.config.memory_limit_mb.saturating_mul(1024 * 1024);
        match (self.memory_probe)() {
            Some(used) if used >= limit => {
                warn!(
                    used_mb = used / (1024 * 1024),
                    limit_mb = self.config.memory_limit_mb,
                    "Memory limit reached"
                );
                true
            }
            _ => false,
        }
    }

    async fn idle(&self) {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.config.sleep) => {}
            _ = stop.wait_for(|stopping| *stopping) => {}
        }
    }

    async fn process(&mut self, mut job: QueuedJob) -> QueueResult<()> {
        let id = job.id().map(ToString::to_string).unwrap_or_default();
        let job_type = job.job_type().to_string();

        info!(job_id = %id, job = %job_type, attempts = job.attempts(), "Processing job");
        self.emit(WorkerEvent::Processing {
            id: id.clone(),
            job: job_type.clone(),
        });

        match self.execute(&mut job).await {
            JobOutcome::Success => {
                self.driver.acknowledge(&job).await?;
                debug!(job_id = %id, job = %job_type, "Job completed");
                self.emit(WorkerEvent::Completed { id, job: job_type });
            }
            JobOutcome::Failure(err) => self.fail(&mut job, err).await?,
        }

        self.processed += 1;
        Ok(())
    }

    async fn execute(&self, job: &mut QueuedJob) -> JobOutcome {
        let run = AssertUnwindSafe(job.handle()).catch_unwind();
        let result = if self.config.timeout.is_zero() {
            Ok(run.await)
        } else {
            tokio::time::timeout(self.config.timeout, run).await
        };

        match result {
            Ok(Ok(Ok(()))) => JobOutcome::Success,
            Ok(Ok(Err(err))) => JobOutcome::Failure(err),
            Ok(Err(panic)) => JobOutcome::Failure(JobError::Panicked(panic_message(panic))),
            Err(_elapsed) => JobOutcome::Failure(JobError::Timeout(self.config.timeout)),
        }
    }

    async fn fail(&self, job: &mut QueuedJob, err: JobError) -> QueueResult<()> {
        let id = job.id().map(ToString::to_string).unwrap_or_default();
        let attempts = job.record_failed_attempt();
        let record = FailureRecord::new(job.job_type(), job.queue(), attempts, &err);

        self.failures.record(FailureLevel::Error, &record).await;
        self.emit(WorkerEvent::Failed {
            id: id.clone(),
            job: record.job.clone(),
            attempts,
            error: record.error.clone(),
        });

        let decision = retry::decide(
            attempts,
            job.max_attempts(),
            err.is_retryable(),
            &job.backoff_strategy(),
        );

        match decision {
            RetryDecision::Retry(delay) => {
                self.driver.release(job, delay).await?;
                info!(
                    job_id = %id,
                    attempt = attempts,
                    delay_secs = delay.as_secs(),
                    "Job failed, scheduling retry with backoff"
                );
                self.emit(WorkerEvent::Released {
                    id,
                    job: record.job,
                    delay,
                });
            }
            RetryDecision::GiveUp => {
                self.driver.delete(job).await?;
                self.failures.record(FailureLevel::Critical, &record).await;
                self.emit(WorkerEvent::Deleted {
                    id,
                    job: record.job,
                    attempts,
                });
            }
        }
        Ok(())
    }

    /// A popped record could not be decoded; the driver already dropped it
    async fn discard(&mut self, id: String, source: DecodeError) {
        let job_type = match &source {
            DecodeError::UnknownJobType(job_type)
            | DecodeError::InvalidPayload { job_type, .. } => job_type.clone(),
            DecodeError::Malformed(_) => "<malformed>".to_string(),
        };
        let record = FailureRecord::new(job_type, self.queue.clone(), 0, &source);

        self.failures.record(FailureLevel::Critical, &record).await;
        self.emit(WorkerEvent::Discarded {
            id,
            error: record.error,
        });
        self.processed += 1;
    }

    /// The driver removed a job whose reservations kept lapsing
    async fn abandon(&mut self, err: QueueError) {
        let QueueError::AttemptsExhausted {
            id,
            job_type,
            queue,
            attempts,
        } = &err
        else {
            return;
        };
        let record = FailureRecord::new(job_type.as_str(), queue.as_str(), *attempts, &err);

        self.failures.record(FailureLevel::Critical, &record).await;
        self.emit(WorkerEvent::Deleted {
            id: id.to_string(),
            job: record.job,
            attempts: *attempts,
        });
        self.processed += 1;
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
