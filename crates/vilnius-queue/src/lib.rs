//! # Vilnius Queue
//!
//! Background job queue for the Vilnius framework.
//!
//! Features:
//! - `Job` trait with a tag registry for rebuilding serialized jobs
//! - Pluggable drivers (sync, in-memory, SQL via `vilnius-persist`)
//! - `QueueManager` resolving the configured driver
//! - Worker with per-job timeout, exponential backoff and graceful stop

pub mod config;
pub mod driver;
pub mod error;
pub mod failure;
pub mod job;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod sync;
pub mod worker;

pub use config::{ConnectionConfig, QueueConfig, Settings};
pub use driver::QueueDriver;
pub use error::{ConfigurationError, DecodeError, JobError, QueueError, QueueResult};
pub use failure::{FailureLevel, FailureLog, FailureRecord, TracingFailureLog};
pub use job::{to_payload, BackoffStrategy, Job, JobId, Payload, QueuedJob};
pub use manager::{DriverContext, QueueManager};
pub use memory::MemoryDriver;
pub use registry::JobRegistry;
pub use sync::SyncDriver;
pub use worker::{StopHandle, Worker, WorkerConfig, WorkerEvent, WorkerObserver, WorkerReport};
