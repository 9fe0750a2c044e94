//! Per-upstream circuit breaker.
//!
//! State changes go through [`next_state`], a total function over every
//! `(state, signal)` pair. Each state change starts a new generation; outcomes
//! reported with a permit from an older generation only update totals.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls are refused until the cooldown elapses.
    Open,
    /// A limited number of trial calls probe recovery.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in logs and audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Input to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Success,
    Failure,
    CooldownElapsed,
}

/// The transition table. `tripped` is whether consecutive failures have
/// reached the threshold, and only matters for `(Closed, Failure)`.
pub(crate) fn next_state(state: CircuitState, signal: Signal, tripped: bool) -> CircuitState {
    use CircuitState::{Closed, HalfOpen, Open};
    match (state, signal) {
        (Closed, Signal::Failure) if tripped => Open,
        (Closed, Signal::Failure | Signal::Success | Signal::CooldownElapsed) => Closed,
        (Open, Signal::CooldownElapsed) => HalfOpen,
        (Open, Signal::Success | Signal::Failure) => Open,
        (HalfOpen, Signal::Success) => Closed,
        (HalfOpen, Signal::Failure) => Open,
        (HalfOpen, Signal::CooldownElapsed) => HalfOpen,
    }
}

/// How a guarded call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    /// Cancelled before an answer; releases a half-open slot without judging.
    Abandoned,
}

/// Proof of admission, tied to the generation it was issued in.
#[derive(Debug)]
pub(crate) struct Permit {
    generation: u64,
}

/// A state change to be logged by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transition {
    pub(crate) from: CircuitState,
    pub(crate) to: CircuitState,
}

/// Snapshot of one upstream's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    /// Upstream name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures in a row in the current generation.
    pub consecutive_failures: u32,
    /// Successes in a row in the current generation.
    pub consecutive_successes: u32,
    /// Calls admitted in the current window or generation.
    pub requests_in_window: u32,
    /// Calls admitted since startup.
    pub total_requests: u64,
    /// Calls that succeeded since startup.
    pub total_successes: u64,
    /// Calls that failed since startup.
    pub total_failures: u64,
    /// Calls refused without invocation since startup.
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    max_requests: u32,
    interval: Option<Duration>,
    cooldown: Duration,
    failure_threshold: u32,
}

struct CircuitRecord {
    state: CircuitState,
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    requests_in_window: u32,
    half_open_admitted: u32,
    window_started: Instant,
    opened_at: Option<Instant>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
}

impl CircuitRecord {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            requests_in_window: 0,
            half_open_admitted: 0,
            window_started: now,
            opened_at: None,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
        }
    }

    fn reset_counts(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.requests_in_window = 0;
        self.half_open_admitted = 0;
        self.window_started = now;
    }

    fn apply(&mut self, signal: Signal, settings: &Settings, now: Instant) -> Option<Transition> {
        let tripped = self.consecutive_failures >= settings.failure_threshold;
        let next = next_state(self.state, signal, tripped);
        if next == self.state {
            return None;
        }
        let from = self.state;
        self.state = next;
        self.generation = self.generation.wrapping_add(1);
        self.reset_counts(now);
        self.opened_at = (next == CircuitState::Open).then_some(now);
        Some(Transition { from, to: next })
    }

    fn stats(&self, name: &str) -> BreakerStats {
        BreakerStats {
            name: name.to_owned(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            requests_in_window: self.requests_in_window,
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            rejected: self.rejected,
        }
    }
}

/// All breakers, one record per upstream name, created on first use.
pub(crate) struct BreakerRegistry {
    settings: Settings,
    records: Mutex<HashMap<String, CircuitRecord>>,
}

impl BreakerRegistry {
    pub(crate) fn new(config: &BreakerConfig) -> Self {
        Self {
            settings: Settings {
                max_requests: config.max_requests.max(1),
                interval: (config.interval_secs > 0)
                    .then(|| Duration::from_secs(config.interval_secs)),
                cooldown: Duration::from_secs(config.cooldown_secs),
                failure_threshold: config.failure_threshold.max(1),
            },
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Ask to make a call. `Err(())` means refused locally.
    pub(crate) fn acquire(&self, name: &str) -> (Result<Permit, ()>, Option<Transition>) {
        let now = Instant::now();
        let settings = self.settings;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry(name.to_owned())
            .or_insert_with(|| CircuitRecord::new(now));

        let mut transition = None;
        if record.state == CircuitState::Open {
            let cooled = record
                .opened_at
                .is_some_and(|at| now.saturating_duration_since(at) >= settings.cooldown);
            if cooled {
                transition = record.apply(Signal::CooldownElapsed, &settings, now);
            }
        }
        if record.state == CircuitState::Closed {
            if let Some(interval) = settings.interval {
                if now.saturating_duration_since(record.window_started) >= interval {
                    record.reset_counts(now);
                }
            }
        }

        let admitted = match record.state {
            CircuitState::Open => false,
            CircuitState::HalfOpen if record.half_open_admitted >= settings.max_requests => false,
            CircuitState::HalfOpen => {
                record.half_open_admitted = record.half_open_admitted.saturating_add(1);
                true
            }
            CircuitState::Closed => true,
        };

        if admitted {
            record.requests_in_window = record.requests_in_window.saturating_add(1);
            record.total_requests = record.total_requests.saturating_add(1);
            (
                Ok(Permit {
                    generation: record.generation,
                }),
                transition,
            )
        } else {
            record.rejected = record.rejected.saturating_add(1);
            (Err(()), transition)
        }
    }

    /// Report how an admitted call ended.
    pub(crate) fn record(&self, name: &str, permit: Permit, outcome: Outcome) -> Option<Transition> {
        let now = Instant::now();
        let settings = self.settings;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.get_mut(name)?;

        match outcome {
            Outcome::Success => record.total_successes = record.total_successes.saturating_add(1),
            Outcome::Failure => record.total_failures = record.total_failures.saturating_add(1),
            Outcome::Abandoned => {}
        }
        if permit.generation != record.generation {
            return None;
        }

        match outcome {
            Outcome::Success => {
                record.consecutive_successes = record.consecutive_successes.saturating_add(1);
                record.consecutive_failures = 0;
                record.apply(Signal::Success, &settings, now)
            }
            Outcome::Failure => {
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                record.consecutive_successes = 0;
                record.apply(Signal::Failure, &settings, now)
            }
            Outcome::Abandoned => {
                if record.state == CircuitState::HalfOpen {
                    record.half_open_admitted = record.half_open_admitted.saturating_sub(1);
                }
                None
            }
        }
    }

    pub(crate) fn stats(&self, name: &str) -> Option<BreakerStats> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(name).map(|r| r.stats(name))
    }

    pub(crate) fn all_stats(&self) -> Vec<BreakerStats> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = records.iter().map(|(name, r)| r.stats(name)).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
