//! Retry policy: a pure function of the job row and the error.

use crate::errors::Error;

/// What the execution loop does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue as pending with the given consumed-attempt count.
    Retry {
        /// New `retry_count` value.
        next_retry_count: i64,
    },
    /// Move to failed and write the audit row.
    Terminal,
}

/// Classify a failed attempt.
///
/// Tampered payloads are always terminal. Everything else retries while
/// `retry_count + 1 < max_retries`; the stored `retry_count` at terminal
/// failure may therefore be less than `max_retries`.
pub fn decide(retry_count: i64, max_retries: i64, error: &Error) -> RetryDecision {
    if error.is_terminal() {
        return RetryDecision::Terminal;
    }
    let next = retry_count + 1;
    if next < max_retries {
        RetryDecision::Retry {
            next_retry_count: next,
        }
    } else {
        RetryDecision::Terminal
    }
}
