//! # Vilnius Persist
//!
//! SQL storage for the Vilnius queue:
//! - `database` queue driver on SQLite
//! - failed-job store usable as a failure log

pub mod failed;
pub mod queue;
pub mod sqlite;

pub use failed::SqliteFailedJobStore;
pub use queue::{register_database_driver, DatabaseDriver};
pub use sqlite::SqliteConfig;
