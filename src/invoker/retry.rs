//! Retry classification and backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Why one attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// Connection, DNS, TLS or timeout failure before a response arrived.
    Transport(String),
    /// The upstream answered with a non-success status.
    Status {
        /// HTTP status code.
        status: u16,
        /// Parsed `Retry-After`, if the response carried one.
        retry_after: Option<Duration>,
        /// Sanitised response body.
        body: String,
    },
}

impl CallFailure {
    /// Transport errors, 5xx, 429 and 408 are retried. Other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
        }
    }
}

/// Exponential backoff with jitter between configured bounds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u32,
    wait_min: Duration,
    wait_max: Duration,
}

impl RetryPolicy {
    pub(crate) fn new(config: &RetryConfig) -> Self {
        let wait_min = Duration::from_millis(config.wait_min_ms);
        let wait_max = Duration::from_millis(config.wait_max_ms).max(wait_min);
        Self {
            max_attempts: config.max_attempts.max(1),
            wait_min,
            wait_max,
        }
    }

    /// Delay before retry number `retry` (zero-based). A 429 `Retry-After`
    /// replaces the computed backoff exactly.
    pub(crate) fn delay(&self, retry: u32, failure: &CallFailure) -> Duration {
        if let CallFailure::Status {
            status: 429,
            retry_after: Some(wait),
            ..
        } = failure
        {
            return *wait;
        }
        self.backoff(retry)
    }

    /// `wait_min * 2^retry`, capped at `wait_max`, jittered into its upper
    /// half and never below `wait_min`.
    pub(crate) fn backoff(&self, retry: u32) -> Duration {
        let min_ms = u64::try_from(self.wait_min.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.wait_max.as_millis()).unwrap_or(u64::MAX);
        let factor = 1_u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ceiling = min_ms.saturating_mul(factor).min(max_ms);
        let floor = (ceiling / 2).max(min_ms).min(ceiling);
        let jittered = if floor < ceiling {
            rand::thread_rng().gen_range(floor..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(jittered)
    }
}
