//! Push command - enqueue a log message job
//!
//! Usage:
//! ```bash
//! vilnius push --message "nightly report ready"
//! vilnius push emails --message "retry later" --delay 30
//! ```

use anyhow::Result;
use clap::Args;
use std::time::Duration;
use vilnius_queue::QueuedJob;

use crate::context::AppContext;
use crate::jobs::LogMessageJob;
use crate::{print_info, print_success};

/// Arguments for the push command
#[derive(Args)]
pub struct PushArgs {
    /// Queue name (defaults to the connection's queue)
    queue: Option<String>,

    /// Message the job writes when it runs
    #[arg(long, short = 'm')]
    message: String,

    /// Seconds before the job becomes available
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Connection from the configuration file
    #[arg(long)]
    connection: Option<String>,
}

/// Run the push command
pub async fn run(ctx: &AppContext, args: PushArgs) -> Result<()> {
    let manager = ctx.manager();
    let driver = ctx.driver(&manager, args.connection.as_deref()).await?;
    let queue = args
        .queue
        .unwrap_or_else(|| manager.default_queue(args.connection.as_deref()));

    let mut job = QueuedJob::new(LogMessageJob {
        message: args.message,
    })
    .on_queue(queue.as_str());

    let id = if args.delay > 0 {
        driver
            .later(&mut job, Duration::from_secs(args.delay))
            .await?
    } else {
        driver.push(&mut job).await?
    };

    if driver.name() == "sync" {
        print_info("The sync driver ran the job immediately");
    }
    print_success(&format!("Pushed job {id} onto {queue}"));
    Ok(())
}
