//! Size and clear commands
//!
//! Usage:
//! ```bash
//! vilnius size emails
//! vilnius clear emails --connection database
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use crate::context::AppContext;
use crate::print_success;

/// Arguments naming one queue on one connection
#[derive(Args)]
pub struct QueueArgs {
    /// Queue name (defaults to the connection's queue)
    queue: Option<String>,

    /// Connection from the configuration file
    #[arg(long)]
    connection: Option<String>,
}

/// Run the size command
pub async fn size(ctx: &AppContext, args: QueueArgs) -> Result<()> {
    let manager = ctx.manager();
    let driver = ctx.driver(&manager, args.connection.as_deref()).await?;
    let queue = args
        .queue
        .unwrap_or_else(|| manager.default_queue(args.connection.as_deref()));

    let size = driver.size(&queue).await?;
    println!(
        "{} {} {}",
        queue.bold(),
        "on".dimmed(),
        driver.name().cyan()
    );
    println!("  {} {}", "Jobs:".dimmed(), size.to_string().green());
    Ok(())
}

/// Run the clear command
pub async fn clear(ctx: &AppContext, args: QueueArgs) -> Result<()> {
    let manager = ctx.manager();
    let driver = ctx.driver(&manager, args.connection.as_deref()).await?;
    let queue = args
        .queue
        .unwrap_or_else(|| manager.default_queue(args.connection.as_deref()));

    let before = driver.size(&queue).await?;
    driver.clear(&queue).await?;
    print_success(&format!("Cleared {before} job(s) from {queue}"));
    Ok(())
}
