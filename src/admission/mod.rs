//! Admission control ahead of every guarded operation.
//!
//! Two independent tiers: `global` for ordinary reads and `admin` for
//! mutations and privileged reads. Each tier owns a local token bucket. When
//! a shared cache is configured and distributed mode is on, tiers are counted
//! in a fixed per-minute window shared across instances instead; any cache
//! error falls back to the local bucket for that request.
//!
//! A separate per-caller limiter keys buckets by client address.

mod bucket;
mod clients;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::audit::{AuditTrail, RequestContext};
use crate::cache::{CacheError, SharedCache};
use crate::config::RateLimitConfig;

use bucket::{BucketOutcome, TokenBucket};
use clients::ClientBuckets;

/// Length of one distributed counting window.
const WINDOW_SECS: i64 = 60;

/// Expiry set on a distributed window key. Twice the window absorbs clock
/// skew between instances.
const WINDOW_EXPIRY: Duration = Duration::from_secs(120);

/// Admission tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Ordinary traffic.
    Global,
    /// Mutations and privileged reads; configured stricter.
    Admin,
}

impl Tier {
    /// Label used in counter keys, metadata and audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Admin => "admin",
        }
    }
}

/// Outcome of one admission check, with the metadata a denial carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the operation may proceed.
    pub allowed: bool,
    /// Which limiter decided: `global`, `admin` or `client`.
    pub scope: &'static str,
    /// Limit of the deciding limiter in its own window.
    pub limit: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Seconds until a retry can succeed. Zero when allowed.
    pub retry_after_secs: u64,
}

/// Limiter configuration snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    /// Global tier requests per second.
    pub global_limit: u32,
    /// Admin tier requests per second.
    pub admin_limit: u32,
    /// Global tier burst.
    pub burst: u32,
    /// Admin tier burst.
    pub admin_burst: u32,
    /// Whether tiers count in the shared cache.
    pub distributed: bool,
    /// `redis` when counting in the shared cache, `local` otherwise.
    pub backend: &'static str,
    /// Caller addresses currently tracked by the per-client limiter.
    pub tracked_clients: usize,
}

/// Per-tier and per-caller admission control.
pub struct AdmissionController {
    global: TokenBucket,
    admin: TokenBucket,
    clients: ClientBuckets,
    cache: Option<Arc<dyn SharedCache>>,
    audit: Arc<AuditTrail>,
}

impl AdmissionController {
    /// Build the controller. `cache` is only used when distributed mode is on.
    pub fn new(
        config: &RateLimitConfig,
        cache: Option<Arc<dyn SharedCache>>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        let admin_burst = (config.burst / 2).max(1);
        Self {
            global: TokenBucket::new(config.global_rps, config.burst),
            admin: TokenBucket::new(config.admin_rps, admin_burst),
            clients: ClientBuckets::new(
                config.per_client_rps,
                config.per_client_burst,
                config.max_tracked_clients,
                Duration::from_secs(config.client_idle_secs),
            ),
            cache: cache.filter(|_| config.distributed),
            audit,
        }
    }

    /// Plain yes/no admission for `tier`, audited without caller details.
    pub async fn allow(&self, tier: Tier) -> bool {
        self.check(&RequestContext::new("anonymous"), tier)
            .await
            .allowed
    }

    /// Admission check for `tier`. Denials are audited with the caller's
    /// masked address.
    pub async fn check(&self, ctx: &RequestContext, tier: Tier) -> RateLimitDecision {
        let decision = match self.cache.as_ref() {
            Some(cache) => match self.check_distributed(cache.as_ref(), tier).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(tier = tier.as_str(), error = %e, "shared counter unavailable, using local bucket");
                    self.check_local(tier)
                }
            },
            None => self.check_local(tier),
        };
        if !decision.allowed {
            self.record_denial(ctx, &decision);
        }
        decision
    }

    /// Per-caller admission keyed by client address.
    pub fn check_client(&self, ctx: &RequestContext, ip: IpAddr) -> RateLimitDecision {
        let decision = decide(
            "client",
            u64::from(self.clients.limit()),
            self.clients.try_take(ip),
        );
        if !decision.allowed {
            self.record_denial(ctx, &decision);
        }
        decision
    }

    /// Prune per-caller buckets idle past the configured threshold.
    pub fn prune_idle_clients(&self) -> usize {
        let pruned = self.clients.prune_idle();
        if pruned > 0 {
            debug!(pruned, "pruned idle client buckets");
        }
        pruned
    }

    /// Current limiter configuration and occupancy.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            global_limit: self.global.rate(),
            admin_limit: self.admin.rate(),
            burst: self.global.burst(),
            admin_burst: self.admin.burst(),
            distributed: self.cache.is_some(),
            backend: if self.cache.is_some() { "redis" } else { "local" },
            tracked_clients: self.clients.len(),
        }
    }

    fn bucket(&self, tier: Tier) -> &TokenBucket {
        match tier {
            Tier::Global => &self.global,
            Tier::Admin => &self.admin,
        }
    }

    fn check_local(&self, tier: Tier) -> RateLimitDecision {
        let bucket = self.bucket(tier);
        decide(tier.as_str(), u64::from(bucket.burst()), bucket.try_take())
    }

    /// Fixed-window count in the shared cache, keyed by tier and UTC minute.
    async fn check_distributed(
        &self,
        cache: &dyn SharedCache,
        tier: Tier,
    ) -> Result<RateLimitDecision, CacheError> {
        let now = Utc::now().timestamp();
        let minute = now.div_euclid(WINDOW_SECS);
        let key = format!("ratelimit:{}:{minute}", tier.as_str());

        let count = cache.increment(&key).await?;
        if count == 1 {
            if let Err(e) = cache.expire(&key, WINDOW_EXPIRY).await {
                warn!(key = %key, error = %e, "failed to set window expiry");
            }
        }

        let limit = u64::from(self.bucket(tier).rate()).saturating_mul(60);
        let used = u64::try_from(count).unwrap_or(0);
        let allowed = used <= limit;
        let until_next_window = WINDOW_SECS.saturating_sub(now.rem_euclid(WINDOW_SECS));
        Ok(RateLimitDecision {
            allowed,
            scope: tier.as_str(),
            limit,
            remaining: limit.saturating_sub(used),
            retry_after_secs: if allowed {
                0
            } else {
                u64::try_from(until_next_window).unwrap_or(1)
            },
        })
    }

    fn record_denial(&self, ctx: &RequestContext, decision: &RateLimitDecision) {
        debug!(
            scope = decision.scope,
            limit = decision.limit,
            retry_after_secs = decision.retry_after_secs,
            "admission denied"
        );
        self.audit
            .log_rate_limit_exceeded(ctx, decision.scope, decision.limit);
    }
}

fn decide(scope: &'static str, limit: u64, outcome: BucketOutcome) -> RateLimitDecision {
    match outcome {
        BucketOutcome::Admitted { remaining } => RateLimitDecision {
            allowed: true,
            scope,
            limit,
            remaining: u64::from(remaining),
            retry_after_secs: 0,
        },
        BucketOutcome::Throttled { retry_after } => RateLimitDecision {
            allowed: false,
            scope,
            limit,
            remaining: 0,
            retry_after_secs: whole_seconds_at_least_one(retry_after),
        },
    }
}

fn whole_seconds_at_least_one(d: Duration) -> u64 {
    let rounded_up = if d.subsec_nanos() > 0 {
        d.as_secs().saturating_add(1)
    } else {
        d.as_secs()
    };
    rounded_up.max(1)
}
