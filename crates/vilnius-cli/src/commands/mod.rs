//! CLI commands

pub mod failed;
pub mod push;
pub mod queue;
pub mod work;
