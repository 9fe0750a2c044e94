//! Outbound calls with retry and a per-upstream circuit breaker.
//!
//! The breaker wraps the whole retried invocation: one admitted call may make
//! several attempts, and only its final outcome is reported to the breaker.
//! Any failed outcome counts against the upstream, retryable or not.
//! Every attempt and every backoff sleep races the caller's
//! [`CancellationToken`]; on cancellation the attempt future is dropped,
//! which aborts the underlying request instead of leaving it running.

mod breaker;
pub mod http;
mod retry;

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::AuditTrail;
use crate::config::{BreakerConfig, RetryConfig};

use breaker::{BreakerRegistry, Outcome, Transition};
use retry::RetryPolicy;

pub use breaker::{BreakerStats, CircuitState};
pub use http::{HttpInvoker, HttpReply};
pub use retry::CallFailure;

/// Errors returned by [`ResilientInvoker::call`].
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// Refused locally: the upstream's breaker is open or its half-open
    /// trial slots are taken. The wrapped call was not invoked.
    #[error("circuit open for upstream {upstream}")]
    CircuitOpen {
        /// Upstream name.
        upstream: String,
    },
    /// The caller cancelled; the in-flight attempt was aborted.
    #[error("call to {upstream} cancelled")]
    Cancelled {
        /// Upstream name.
        upstream: String,
    },
    /// No response could be obtained.
    #[error("transport failure calling {upstream}: {message}")]
    Transport {
        /// Upstream name.
        upstream: String,
        /// Transport error text.
        message: String,
    },
    /// The upstream answered with a non-success status.
    #[error("{upstream} responded with HTTP {status}: {body}")]
    Status {
        /// Upstream name.
        upstream: String,
        /// HTTP status code.
        status: u16,
        /// Sanitised response body.
        body: String,
    },
    /// The response arrived but could not be decoded.
    #[error("failed to decode response from {upstream}: {message}")]
    Decode {
        /// Upstream name.
        upstream: String,
        /// Decoder error text.
        message: String,
    },
}

impl InvokeError {
    /// Whether the call was refused locally rather than failed upstream.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    fn from_failure(upstream: &str, failure: CallFailure) -> Self {
        match failure {
            CallFailure::Transport(message) => Self::Transport {
                upstream: upstream.to_owned(),
                message,
            },
            CallFailure::Status { status, body, .. } => Self::Status {
                upstream: upstream.to_owned(),
                status,
                body,
            },
        }
    }
}

/// How a retried invocation ended before breaker accounting.
enum Finished<T> {
    Done(T),
    Failed(CallFailure),
    Cancelled,
}

/// Retrying, circuit-broken executor for outbound calls.
pub struct ResilientInvoker {
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    audit: Arc<AuditTrail>,
}

impl ResilientInvoker {
    /// Build an invoker sharing one breaker configuration across upstreams.
    pub fn new(breaker: &BreakerConfig, retry: &RetryConfig, audit: Arc<AuditTrail>) -> Self {
        Self {
            breakers: BreakerRegistry::new(breaker),
            retry: RetryPolicy::new(retry),
            audit,
        }
    }

    /// Run `attempt` against `upstream` under its breaker, retrying
    /// retryable failures.
    ///
    /// `attempt` is called once per try and must build a fresh request each
    /// time. The integration call is audited whatever the outcome.
    ///
    /// # Errors
    ///
    /// [`InvokeError::CircuitOpen`] when refused locally,
    /// [`InvokeError::Cancelled`] when `cancel` fires, otherwise the last
    /// attempt's failure.
    pub async fn call<T, F, Fut>(
        &self,
        upstream: &str,
        operation: &str,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, InvokeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallFailure>>,
    {
        let started = Instant::now();

        let (permit, transition) = self.breakers.acquire(upstream);
        self.log_transition(upstream, transition);
        let Ok(permit) = permit else {
            debug!(upstream, operation, "circuit open, call refused");
            let err = InvokeError::CircuitOpen {
                upstream: upstream.to_owned(),
            };
            self.audit.log_integration_call(
                upstream,
                operation,
                Some(&err.to_string()),
                started.elapsed(),
            );
            return Err(err);
        };

        let finished = self
            .run_with_retry(upstream, operation, cancel, &mut attempt)
            .await;

        let outcome = match &finished {
            Finished::Done(_) => Outcome::Success,
            Finished::Failed(_) => Outcome::Failure,
            Finished::Cancelled => Outcome::Abandoned,
        };
        let transition = self.breakers.record(upstream, permit, outcome);
        self.log_transition(upstream, transition);

        let result = match finished {
            Finished::Done(value) => Ok(value),
            Finished::Failed(failure) => Err(InvokeError::from_failure(upstream, failure)),
            Finished::Cancelled => Err(InvokeError::Cancelled {
                upstream: upstream.to_owned(),
            }),
        };
        let error = result.as_ref().err().map(ToString::to_string);
        self.audit
            .log_integration_call(upstream, operation, error.as_deref(), started.elapsed());
        result
    }

    /// Breaker snapshot for one upstream, if it has been called.
    pub fn breaker_stats(&self, upstream: &str) -> Option<BreakerStats> {
        self.breakers.stats(upstream)
    }

    /// Breaker snapshots for every upstream called so far, by name.
    pub fn breakers(&self) -> Vec<BreakerStats> {
        self.breakers.all_stats()
    }

    /// Record a credential refresh for an upstream integration.
    pub fn record_token_refresh(&self, upstream: &str, error: Option<&str>) {
        self.audit.log_token_refresh(upstream, error);
    }

    async fn run_with_retry<T, F, Fut>(
        &self,
        upstream: &str,
        operation: &str,
        cancel: &CancellationToken,
        attempt: &mut F,
    ) -> Finished<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallFailure>>,
    {
        let mut tries: u32 = 0;
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Finished::Cancelled,
                result = attempt() => result,
            };
            let failure = match result {
                Ok(value) => return Finished::Done(value),
                Err(failure) => failure,
            };

            tries = tries.saturating_add(1);
            if !failure.is_retryable() || tries >= self.retry.max_attempts {
                return Finished::Failed(failure);
            }

            let delay = self.retry.delay(tries.saturating_sub(1), &failure);
            warn!(
                upstream,
                operation,
                attempt = tries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                failure = ?failure,
                "upstream call failed, retrying"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Finished::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn log_transition(&self, upstream: &str, transition: Option<Transition>) {
        if let Some(Transition { from, to }) = transition {
            warn!(
                upstream,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker state change"
            );
            self.audit
                .log_breaker_transition(upstream, from.as_str(), to.as_str());
        }
    }
}
