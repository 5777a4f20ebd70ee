//! Failed command - jobs that exhausted their attempts
//!
//! Usage:
//! ```bash
//! vilnius failed
//! vilnius failed --flush
//! ```

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;

use crate::context::AppContext;
use crate::{print_info, print_success};

/// Arguments for the failed command
#[derive(Args)]
pub struct FailedArgs {
    /// Connection whose database holds the failed jobs
    #[arg(long)]
    connection: Option<String>,

    /// Maximum number of entries to show
    #[arg(long, default_value_t = 20)]
    limit: u32,

    /// Delete every stored failure instead of listing
    #[arg(long)]
    flush: bool,
}

/// Run the failed command
pub async fn run(ctx: &AppContext, args: FailedArgs) -> Result<()> {
    let Some(store) = ctx.failed_store(args.connection.as_deref()).await? else {
        bail!("Failed jobs are only stored for connections using the database driver");
    };

    if args.flush {
        let removed = store.flush().await?;
        print_success(&format!("Removed {removed} failed job(s)"));
        return Ok(());
    }

    let records = store.list(args.limit).await?;
    if records.is_empty() {
        print_info("No failed jobs");
        return Ok(());
    }

    println!("{}", "Failed jobs".bold().cyan());
    println!("{}", "═".repeat(40).cyan());
    for record in records {
        println!(
            "{} {} {} {}",
            record.failed_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            record.job.bold(),
            format!("[{}]", record.queue).cyan(),
            format!("after {} attempt(s)", record.attempts).dimmed()
        );
        println!("    {}", record.error.red());
    }
    Ok(())
}
