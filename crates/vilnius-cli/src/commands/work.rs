//! Work command - run a queue worker
//!
//! Usage:
//! ```bash
//! vilnius work
//! vilnius work emails --connection database --max-jobs 500 --timeout 120
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use vilnius_queue::failure::FanoutFailureLog;
use vilnius_queue::worker::listen_for_signals;
use vilnius_queue::{TracingFailureLog, Worker, WorkerConfig, WorkerEvent, WorkerObserver};

use crate::context::AppContext;
use crate::{print_error, print_info, print_success, print_warning};

/// Arguments for the work command
#[derive(Args)]
pub struct WorkArgs {
    /// Queue to process (defaults to the connection's queue)
    queue: Option<String>,

    /// Connection from the configuration file
    #[arg(long)]
    connection: Option<String>,

    /// Stop after this many jobs (0 = no limit)
    #[arg(long, default_value_t = 0)]
    max_jobs: u64,

    /// Stop once memory use reaches this many megabytes
    #[arg(long, default_value_t = 128)]
    memory: u64,

    /// Seconds a single job may run (0 = no limit)
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Seconds to wait when the queue is empty
    #[arg(long, default_value_t = 3)]
    sleep: u64,
}

impl WorkArgs {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_jobs: self.max_jobs,
            memory_limit_mb: self.memory,
            timeout: Duration::from_secs(self.timeout),
            sleep: Duration::from_secs(self.sleep),
        }
    }
}

/// Prints one line per worker event
struct ConsoleObserver;

impl WorkerObserver for ConsoleObserver {
    fn on_event(&self, event: &WorkerEvent) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let stamp = stamp.dimmed();
        match event {
            WorkerEvent::Processing { id, job } => {
                println!("{stamp} {} {} {}", "Processing:".yellow(), job.bold(), id.dimmed());
            }
            WorkerEvent::Completed { id, job } => {
                println!("{stamp} {} {} {}", "Processed: ".green(), job.bold(), id.dimmed());
            }
            WorkerEvent::Failed {
                id,
                job,
                attempts,
                error,
            } => {
                println!(
                    "{stamp} {} {} {} {}",
                    "Failed:    ".red(),
                    job.bold(),
                    id.dimmed(),
                    format!("(attempt {attempts}: {error})").red()
                );
            }
            WorkerEvent::Released { job, delay, .. } => {
                println!(
                    "{stamp} {} {} {}",
                    "Released:  ".yellow(),
                    job.bold(),
                    format!("retrying in {}s", delay.as_secs()).dimmed()
                );
            }
            WorkerEvent::Deleted { job, attempts, .. } => {
                println!(
                    "{stamp} {} {} {}",
                    "Deleted:   ".red().bold(),
                    job.bold(),
                    format!("gave up after {attempts} attempt(s)").dimmed()
                );
            }
            WorkerEvent::Discarded { id, error } => {
                println!(
                    "{stamp} {} {} {}",
                    "Discarded: ".red().bold(),
                    id.dimmed(),
                    error.red()
                );
            }
            WorkerEvent::Stopping { reason } => {
                println!("{stamp} {} {reason}", "Stopping:  ".cyan());
            }
        }
    }
}

/// Run the work command
pub async fn run(ctx: &AppContext, args: WorkArgs) -> Result<()> {
    let manager = ctx.manager();
    let connection = args.connection.as_deref();
    let driver = ctx.driver(&manager, connection).await?;
    let queue = args
        .queue
        .clone()
        .unwrap_or_else(|| manager.default_queue(connection));

    if driver.name() == "sync" {
        print_warning("The sync driver runs jobs on push; there is nothing to work");
        return Ok(());
    }

    let mut failures = FanoutFailureLog::new().with(Arc::new(TracingFailureLog));
    if let Some(store) = ctx.failed_store(connection).await? {
        failures = failures.with(Arc::new(store));
    }

    let mut worker = Worker::new(driver.clone(), queue.as_str(), args.worker_config())
        .with_failure_log(Arc::new(failures))
        .with_observer(Arc::new(ConsoleObserver));
    let signals = listen_for_signals(worker.stop_handle());

    print_info(&format!(
        "Processing jobs from {} on {}",
        queue.bold(),
        driver.name().cyan()
    ));

    let result = worker.run().await;
    signals.abort();

    match result {
        Ok(report) => {
            print_success(&format!(
                "Worker stopped ({}) after {} job(s)",
                report.reason, report.processed
            ));
            Ok(())
        }
        Err(e) => {
            print_error(&format!("Worker stopped on a queue error: {e}"));
            Err(e.into())
        }
    }
}
