//! Dependency health checks for liveness and readiness probes.
//!
//! Health is classified on reachability alone. The primary datastore gates
//! readiness; the shared cache never does, and a missing cache is reported as
//! `not_configured` rather than as a failure.

pub mod postgres;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::cache::SharedCache;

pub use postgres::PostgresProbe;

/// Reachability of one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Reachable and answering.
    Healthy,
    /// Unreachable, erroring or too slow.
    Unhealthy,
    /// Not part of this deployment.
    NotConfigured,
}

/// Aggregate status of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Every configured dependency is healthy.
    Healthy,
    /// At least one configured dependency is unhealthy; still serving.
    Degraded,
}

/// Server details reported by the primary datastore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatastoreDetails {
    /// Server version banner.
    pub version: String,
    /// Sessions currently open on the server.
    pub active_connections: i64,
    /// Configured session ceiling.
    pub max_connections: i64,
    /// Human-readable database size.
    pub size: String,
}

/// Result of checking one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    /// Classification.
    pub status: HealthState,
    /// Time the check took.
    pub response_time_ms: u64,
    /// Failure description when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Datastore details when the primary check succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<DatastoreDetails>,
}

impl DependencyHealth {
    fn not_configured() -> Self {
        Self {
            status: HealthState::NotConfigured,
            response_time_ms: 0,
            error: None,
            details: None,
        }
    }

    fn unhealthy(error: String, elapsed: Duration) -> Self {
        Self {
            status: HealthState::Unhealthy,
            response_time_ms: millis(elapsed),
            error: Some(error),
            details: None,
        }
    }

    /// Whether the dependency counts against the aggregate status.
    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthState::Unhealthy
    }
}

/// Full health report.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    /// Aggregate status.
    pub status: ServiceStatus,
    /// When the report was produced.
    pub timestamp: DateTime<Utc>,
    /// Service version label.
    pub version: String,
    /// Seconds since the monitor was created.
    pub uptime_secs: u64,
    /// Primary datastore check.
    pub primary: DependencyHealth,
    /// Shared cache check.
    pub cache: DependencyHealth,
}

/// Errors from a primary datastore probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// No connection could be established.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Connected, but a diagnostic query failed.
    #[error("query failed: {0}")]
    Query(String),
}

/// Checks the primary datastore.
#[async_trait]
pub trait PrimaryProbe: Send + Sync {
    /// Connect, ping and collect server details.
    async fn probe(&self) -> Result<DatastoreDetails, ProbeError>;
}

/// On-demand dependency health checks.
pub struct HealthMonitor {
    primary: Arc<dyn PrimaryProbe>,
    cache: Option<Arc<dyn SharedCache>>,
    deadline: Duration,
    version: String,
    started: Instant,
    serving: AtomicBool,
}

impl HealthMonitor {
    /// Create a monitor. `cache = None` means no cache is configured.
    pub fn new(
        primary: Arc<dyn PrimaryProbe>,
        cache: Option<Arc<dyn SharedCache>>,
        deadline: Duration,
        version: impl Into<String>,
    ) -> Self {
        Self {
            primary,
            cache,
            deadline,
            version: version.into(),
            started: Instant::now(),
            serving: AtomicBool::new(false),
        }
    }

    /// Flag the process as serving. Liveness reports true from here on.
    pub fn mark_serving(&self) {
        self.serving.store(true, Ordering::Release);
    }

    /// Whether the process is up and serving.
    pub fn liveness(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    /// Whether the process is fit for traffic: the primary datastore is
    /// reachable. Cache health is not consulted.
    pub async fn readiness(&self) -> bool {
        self.check_primary().await.status == HealthState::Healthy
    }

    /// Check the primary datastore within the configured deadline.
    pub async fn check_primary(&self) -> DependencyHealth {
        let start = Instant::now();
        match tokio::time::timeout(self.deadline, self.primary.probe()).await {
            Ok(Ok(details)) => DependencyHealth {
                status: HealthState::Healthy,
                response_time_ms: millis(start.elapsed()),
                error: None,
                details: Some(details),
            },
            Ok(Err(e)) => {
                warn!(error = %e, "primary datastore unhealthy");
                DependencyHealth::unhealthy(e.to_string(), start.elapsed())
            }
            Err(_) => {
                warn!(deadline_ms = millis(self.deadline), "primary datastore check timed out");
                DependencyHealth::unhealthy(
                    format!("check timed out after {}ms", millis(self.deadline)),
                    start.elapsed(),
                )
            }
        }
    }

    /// Ping the shared cache within the configured deadline.
    pub async fn check_cache(&self) -> DependencyHealth {
        let Some(cache) = self.cache.as_ref() else {
            return DependencyHealth::not_configured();
        };
        let start = Instant::now();
        match tokio::time::timeout(self.deadline, cache.ping()).await {
            Ok(Ok(())) => DependencyHealth {
                status: HealthState::Healthy,
                response_time_ms: millis(start.elapsed()),
                error: None,
                details: None,
            },
            Ok(Err(e)) => {
                warn!(error = %e, "shared cache unhealthy");
                DependencyHealth::unhealthy(e.to_string(), start.elapsed())
            }
            Err(_) => DependencyHealth::unhealthy(
                format!("ping timed out after {}ms", millis(self.deadline)),
                start.elapsed(),
            ),
        }
    }

    /// Check every dependency and aggregate.
    pub async fn check(&self) -> ServiceHealth {
        let (primary, cache) = tokio::join!(self.check_primary(), self.check_cache());
        let status = if primary.is_unhealthy() || cache.is_unhealthy() {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Healthy
        };
        ServiceHealth {
            status,
            timestamp: Utc::now(),
            version: self.version.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
            primary,
            cache,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
