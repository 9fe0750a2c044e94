//! Continuous-refill token bucket backed by `governor`.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, StateInformationMiddleware>;

/// Result of taking one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BucketOutcome {
    /// Token taken; `remaining` tokens are left right now.
    Admitted { remaining: u32 },
    /// Bucket empty; the next token is available after `retry_after`.
    Throttled { retry_after: Duration },
}

/// Non-blocking token bucket.
pub(crate) struct TokenBucket {
    limiter: Limiter,
    clock: DefaultClock,
    rate: u32,
    burst: u32,
}

impl TokenBucket {
    /// Bucket refilling `rate` tokens per second up to `burst`.
    pub(crate) fn new(rate: u32, burst: u32) -> Self {
        let rate_nz = NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN);
        let burst_nz = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate_nz).allow_burst(burst_nz);
        Self {
            limiter: RateLimiter::direct(quota).with_middleware::<StateInformationMiddleware>(),
            clock: DefaultClock::default(),
            rate: rate_nz.get(),
            burst: burst_nz.get(),
        }
    }

    /// Take one token if available. Never blocks.
    pub(crate) fn try_take(&self) -> BucketOutcome {
        match self.limiter.check() {
            Ok(snapshot) => BucketOutcome::Admitted {
                remaining: snapshot.remaining_burst_capacity(),
            },
            Err(not_until) => BucketOutcome::Throttled {
                retry_after: not_until.wait_time_from(self.clock.now()),
            },
        }
    }

    pub(crate) fn rate(&self) -> u32 {
        self.rate
    }

    pub(crate) fn burst(&self) -> u32 {
        self.burst
    }
}
