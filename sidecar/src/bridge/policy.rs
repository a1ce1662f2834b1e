//! Retry policy for bridge calls.
//!
//! The bridge never retries on its own. A caller opts in per call through
//! [`ExecuteOptions::with_retry`](super::ExecuteOptions::with_retry); each
//! attempt is a separate request with a fresh correlation id, and the caller
//! only ever observes the outcome of the last attempt.
//!
//! # Example
//!
//! ```ignore
//! use sidecar::bridge::RetryPolicy;
//!
//! // Three attempts, 250ms apart
//! let policy = RetryPolicy::fixed(3, Duration::from_millis(250));
//!
//! // Exponential backoff with defaults
//! let policy = RetryPolicy::exponential(4);
//! ```

use std::time::Duration;

/// Default initial delay for exponential backoff (100ms).
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

/// Default maximum delay for exponential backoff (10 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 10;

/// Default multiplier for exponential backoff.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// How a bridge call handles retryable failures.
///
/// Only [`Timeout`](super::BridgeError::Timeout) and
/// [`RemoteExecutionFailure`](super::BridgeError::RemoteExecutionFailure)
/// are retried.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RetryPolicy {
    /// Fail on the first error.
    #[default]
    None,

    /// Fixed number of attempts with a constant delay between them.
    Fixed {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Delay between attempts.
        delay: Duration,
    },

    /// Delay grows by `multiplier` after each failure, capped at `max_delay`.
    ExponentialBackoff {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Delay after the first failure.
        initial_delay: Duration,
        /// Upper bound for any single delay.
        max_delay: Duration,
        /// Growth factor applied after each failure.
        multiplier: f64,
    },
}

impl RetryPolicy {
    /// Creates a fixed retry policy.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum number of attempts (including initial)
    /// * `delay` - Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Creates an exponential backoff policy with default timings.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::ExponentialBackoff {
            max_attempts,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Delay before the next attempt, given the number of attempts made.
    ///
    /// # Arguments
    ///
    /// * `attempt` - Attempts completed so far (1 after the first failure)
    ///
    /// # Returns
    ///
    /// `None` once the attempt budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => (attempt < *max_attempts).then_some(*delay),
            Self::ExponentialBackoff {
                max_attempts,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay_ms = (initial_delay.as_millis() as f64 * factor)
                    .min(max_delay.as_millis() as f64);
                Some(Duration::from_millis(delay_ms as u64))
            }
        }
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }
}
