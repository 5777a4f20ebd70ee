//! Retry policy applied after a failed execution

use std::time::Duration;

use crate::job::BackoffStrategy;

/// What to do with a job whose latest attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Release the job, ready again after the delay
    Retry(Duration),
    /// Delete the job, it has failed for good
    GiveUp,
}

/// Decide between retry and give-up.
///
/// `attempts` already counts the failure being decided on.
pub fn decide(
    attempts: u32,
    max_attempts: u32,
    retryable: bool,
    backoff: &BackoffStrategy,
) -> RetryDecision {
    if !retryable || attempts >= max_attempts {
        RetryDecision::GiveUp
    } else {
        RetryDecision::Retry(backoff.delay(attempts))
    }
}
