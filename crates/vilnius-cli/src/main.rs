//! Vilnius CLI - queue worker and queue tooling
//!
//! # Usage
//!
//! ```bash
//! # Process jobs from the default queue until stopped
//! vilnius work
//!
//! # Process at most 100 jobs from "emails" on the database connection
//! vilnius work emails --connection database --max-jobs 100
//!
//! # Push a log message job, five seconds from now
//! vilnius push --message "hello" --delay 5
//!
//! # Inspect and empty a queue
//! vilnius size emails
//! vilnius clear emails
//!
//! # Show jobs that failed for the last time
//! vilnius failed
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod commands;
mod context;
mod jobs;

use commands::{failed, push, queue, work};
use context::AppContext;

/// Vilnius - background job queue
#[derive(Parser)]
#[command(
    name = "vilnius",
    version,
    about = "Vilnius queue worker",
    long_about = "Runs queue workers and inspects queues for the Vilnius framework.\n\n\
                  Connections are read from vilnius.toml (or --config) and can be\n\
                  overridden with VILNIUS__QUEUE__... environment variables."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to ./vilnius.toml when present)
    #[arg(long, short = 'c', global = true, env = "VILNIUS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process jobs from a queue
    #[command(name = "work")]
    Work(work::WorkArgs),

    /// Push a log message job onto a queue
    #[command(name = "push")]
    Push(push::PushArgs),

    /// Show how many jobs a queue holds
    #[command(name = "size")]
    Size(queue::QueueArgs),

    /// Remove every job from a queue
    #[command(name = "clear")]
    Clear(queue::QueueArgs),

    /// List or flush permanently failed jobs
    #[command(name = "failed")]
    Failed(failed::FailedArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let ctx = AppContext::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Work(args) => work::run(&ctx, args).await,
        Commands::Push(args) => push::run(&ctx, args).await,
        Commands::Size(args) => queue::size(&ctx, args).await,
        Commands::Clear(args) => queue::clear(&ctx, args).await,
        Commands::Failed(args) => failed::run(&ctx, args).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message with an X
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
