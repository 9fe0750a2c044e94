//! Control surface: every inbound operation, behind admission control.
//!
//! Each operation runs the same pipeline:
//!
//! 1. admission for its tier (`admin` for mutations and privileged reads,
//!    `global` otherwise); a denial carries the limiter metadata,
//! 2. for mutations, a constant-time check of the pre-shared credential,
//! 3. execution against the owning component,
//! 4. one `http_request` audit record with the outcome and duration.
//!
//! Transport adapters (HTTP, RPC, CLI) translate [`Response`] and never talk
//! to the components directly.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::access::{AccessEntry, AccessListError, AccessListManager, ListKind};
use crate::admission::{AdmissionController, RateLimitDecision, RateLimiterStats, Tier};
use crate::audit::{AuditTrail, RequestContext};
use crate::cache::{CacheStats, SharedCache};
use crate::health::{DependencyHealth, HealthMonitor, ServiceHealth};
use crate::invoker::{BreakerStats, InvokeError, ResilientInvoker};
use crate::workload::{
    ContainerSnapshot, ContainerStats, ImageSnapshot, LogQuery, NetworkSnapshot, RuntimeInfo,
    VolumeSnapshot, WorkloadController, WorkloadError,
};

/// Failure category carried by an unsuccessful [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed input or duplicate entry. Not worth retrying.
    Validation,
    /// Unknown container or access entry.
    NotFound,
    /// Refused locally by an open circuit breaker.
    CircuitOpen,
    /// Reverse-proxy config write failed; the mutation was rolled back.
    Synchronization,
    /// A dependency failed or timed out.
    TransientDependency,
    /// Missing or wrong credential.
    Unauthorized,
    /// Admission denied.
    RateLimited,
    /// The backing component is not configured on this instance.
    NotConfigured,
}

/// Errors from control operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Access list failure.
    #[error(transparent)]
    Access(#[from] AccessListError),
    /// Container runtime failure.
    #[error(transparent)]
    Workload(#[from] WorkloadError),
    /// Outbound integration failure.
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    /// Bad input caught before reaching a component.
    #[error("{0}")]
    Validation(String),
    /// The named component is not configured.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl ControlError {
    /// Category for the response.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Access(AccessListError::Validation(_))
            | Self::Workload(WorkloadError::Validation(_))
            | Self::Validation(_) => FailureKind::Validation,
            Self::Access(AccessListError::NotFound { .. })
            | Self::Workload(WorkloadError::NotFound { .. }) => FailureKind::NotFound,
            Self::Access(AccessListError::Sync(_)) => FailureKind::Synchronization,
            Self::Invoke(e) if e.is_circuit_open() => FailureKind::CircuitOpen,
            Self::Workload(_) | Self::Invoke(_) => FailureKind::TransientDependency,
            Self::NotConfigured(_) => FailureKind::NotConfigured,
        }
    }
}

/// Result envelope for every control operation.
#[derive(Debug, Clone, Serialize)]
pub struct Response<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Failure category, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    /// Limiter metadata, on admission denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitDecision>,
    /// Payload, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Response<T> {
    fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            kind: None,
            rate_limit: None,
            data: Some(data),
        }
    }

    fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            kind: Some(kind),
            rate_limit: None,
            data: None,
        }
    }

    fn rate_limited(decision: RateLimitDecision) -> Self {
        Self {
            rate_limit: Some(decision),
            ..Self::failure(FailureKind::RateLimited, "rate limit exceeded")
        }
    }
}

/// Who is calling and with what credential.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Request identity.
    pub ctx: RequestContext,
    /// Pre-shared credential, if presented.
    pub credential: Option<String>,
}

impl Caller {
    /// Caller without a credential.
    pub fn anonymous(ctx: RequestContext) -> Self {
        Self {
            ctx,
            credential: None,
        }
    }

    /// Caller presenting `credential`.
    pub fn with_credential(ctx: RequestContext, credential: impl Into<String>) -> Self {
        Self {
            ctx,
            credential: Some(credential.into()),
        }
    }
}

/// New access entry as submitted by a caller.
#[derive(Debug, Clone)]
pub struct NewEntry {
    /// IP or CIDR.
    pub pattern: String,
    /// Free-form note.
    pub description: String,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired access entries removed.
    pub expired_entries: usize,
    /// Idle per-client buckets dropped.
    pub pruned_clients: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpClass {
    Read,
    AdminRead,
    Mutation,
}

impl OpClass {
    /// Tiers charged in order. Admin operations draw from the global tier
    /// as well as their own.
    fn tiers(self) -> &'static [Tier] {
        match self {
            Self::Read => &[Tier::Global],
            Self::AdminRead | Self::Mutation => &[Tier::Global, Tier::Admin],
        }
    }
}

/// Components behind the control surface.
pub struct Components {
    /// Admission control.
    pub admission: Arc<AdmissionController>,
    /// Allow/deny registry.
    pub access: Arc<AccessListManager>,
    /// Container supervision, when a runtime is configured.
    pub workloads: Option<Arc<WorkloadController>>,
    /// Dependency health.
    pub health: Arc<HealthMonitor>,
    /// Shared cache, when configured.
    pub cache: Option<Arc<dyn SharedCache>>,
    /// Outbound call executor.
    pub invoker: Arc<ResilientInvoker>,
    /// Audit sink.
    pub audit: Arc<AuditTrail>,
}

/// The control plane's inbound operations.
pub struct ControlPlane {
    parts: Components,
    api_key: String,
}

impl ControlPlane {
    /// Assemble the control plane. `api_key` guards every mutation.
    pub fn new(parts: Components, api_key: impl Into<String>) -> Self {
        Self {
            parts,
            api_key: api_key.into(),
        }
    }

    // ── Health ──────────────────────────────────────────────────

    /// Flag the process as serving; liveness reports true from here on.
    pub fn mark_serving(&self) {
        self.parts.health.mark_serving();
    }

    /// Liveness probe. Not rate limited.
    pub fn liveness(&self) -> bool {
        self.parts.health.liveness()
    }

    /// Readiness probe. Not rate limited.
    pub async fn readiness(&self) -> bool {
        self.parts.health.readiness().await
    }

    /// Aggregate health report.
    pub async fn health(&self, caller: &Caller) -> Response<ServiceHealth> {
        self.run(
            caller,
            "health",
            "service",
            OpClass::Read,
            "health report",
            move || async move {
                Ok(self.parts.health.check().await)
            },
        )
        .await
    }

    /// Primary datastore detail.
    pub async fn primary_health(&self, caller: &Caller) -> Response<DependencyHealth> {
        self.run(
            caller,
            "primary_health",
            "primary",
            OpClass::AdminRead,
            "primary datastore health",
            move || async move {
                Ok(self.parts.health.check_primary().await)
            },
        )
        .await
    }

    /// Shared cache detail.
    pub async fn cache_health(&self, caller: &Caller) -> Response<DependencyHealth> {
        self.run(
            caller,
            "cache_health",
            "cache",
            OpClass::AdminRead,
            "cache health",
            move || async move {
                Ok(self.parts.health.check_cache().await)
            },
        )
        .await
    }

    // ── Limiter and cache ───────────────────────────────────────

    /// Rate limiter configuration and occupancy.
    pub async fn rate_limiter_stats(&self, caller: &Caller) -> Response<RateLimiterStats> {
        self.run(
            caller,
            "rate_limiter_stats",
            "rate_limiter",
            OpClass::Read,
            "rate limiter stats",
            move || async move {
                Ok(self.parts.admission.stats())
            },
        )
        .await
    }

    /// Shared cache usage counters.
    pub async fn cache_stats(&self, caller: &Caller) -> Response<CacheStats> {
        self.run(
            caller,
            "cache_stats",
            "cache",
            OpClass::AdminRead,
            "cache stats",
            move || async move {
                self.parts
                    .cache
                    .as_ref()
                    .map(|cache| cache.stats())
                    .ok_or(ControlError::NotConfigured("shared cache"))
            },
        )
        .await
    }

    /// Circuit breaker snapshots for every upstream called so far.
    pub async fn breaker_stats(&self, caller: &Caller) -> Response<Vec<BreakerStats>> {
        self.run(
            caller,
            "breaker_stats",
            "invoker",
            OpClass::Read,
            "circuit breakers",
            move || async move {
                Ok(self.parts.invoker.breakers())
            },
        )
        .await
    }

    // ── Containers ──────────────────────────────────────────────

    /// All containers, including stopped ones.
    pub async fn list_containers(&self, caller: &Caller) -> Response<Vec<ContainerSnapshot>> {
        self.run(
            caller,
            "list_containers",
            "containers",
            OpClass::Read,
            "containers",
            move || async move {
                Ok(self.workloads()?.list_containers().await?)
            },
        )
        .await
    }

    /// Platform-managed containers.
    pub async fn platform_services(&self, caller: &Caller) -> Response<Vec<ContainerSnapshot>> {
        self.run(
            caller,
            "platform_services",
            "containers",
            OpClass::Read,
            "platform services",
            move || async move {
                Ok(self.workloads()?.platform_services().await?)
            },
        )
        .await
    }

    /// One container.
    pub async fn describe_container(
        &self,
        caller: &Caller,
        id: &str,
    ) -> Response<ContainerSnapshot> {
        self.run(
            caller,
            "describe_container",
            id,
            OpClass::Read,
            "container",
            move || async move {
                Ok(self.workloads()?.describe(id).await?)
            },
        )
        .await
    }

    /// Start a container. Requires the credential.
    pub async fn start_container(&self, caller: &Caller, id: &str) -> Response<()> {
        self.run(
            caller,
            "start_container",
            id,
            OpClass::Mutation,
            "container started",
            move || async move {
                Ok(self.workloads()?.start(&caller.ctx, id).await?)
            },
        )
        .await
    }

    /// Stop a container. Requires the credential.
    pub async fn stop_container(
        &self,
        caller: &Caller,
        id: &str,
        grace: Option<Duration>,
    ) -> Response<()> {
        self.run(
            caller,
            "stop_container",
            id,
            OpClass::Mutation,
            "container stopped",
            move || async move {
                Ok(self.workloads()?.stop(&caller.ctx, id, grace).await?)
            },
        )
        .await
    }

    /// Restart a container. Requires the credential.
    pub async fn restart_container(
        &self,
        caller: &Caller,
        id: &str,
        grace: Option<Duration>,
    ) -> Response<()> {
        self.run(
            caller,
            "restart_container",
            id,
            OpClass::Mutation,
            "container restarted",
            move || async move {
                Ok(self.workloads()?.restart(&caller.ctx, id, grace).await?)
            },
        )
        .await
    }

    /// Bounded log tail.
    pub async fn container_logs(
        &self,
        caller: &Caller,
        id: &str,
        query: &LogQuery,
    ) -> Response<String> {
        self.run(
            caller,
            "container_logs",
            id,
            OpClass::AdminRead,
            "container logs",
            move || async move {
                Ok(self.workloads()?.logs(id, query).await?)
            },
        )
        .await
    }

    /// One live stats sample.
    pub async fn container_stats(&self, caller: &Caller, id: &str) -> Response<ContainerStats> {
        self.run(
            caller,
            "container_stats",
            id,
            OpClass::Read,
            "container stats",
            move || async move {
                Ok(self.workloads()?.stats(id).await?)
            },
        )
        .await
    }

    /// Local images.
    pub async fn images(&self, caller: &Caller) -> Response<Vec<ImageSnapshot>> {
        self.run(
            caller,
            "list_images",
            "images",
            OpClass::Read,
            "images",
            move || async move {
                Ok(self.workloads()?.images().await?)
            },
        )
        .await
    }

    /// Runtime networks.
    pub async fn networks(&self, caller: &Caller) -> Response<Vec<NetworkSnapshot>> {
        self.run(
            caller,
            "list_networks",
            "networks",
            OpClass::Read,
            "networks",
            move || async move {
                Ok(self.workloads()?.networks().await?)
            },
        )
        .await
    }

    /// Runtime volumes.
    pub async fn volumes(&self, caller: &Caller) -> Response<Vec<VolumeSnapshot>> {
        self.run(
            caller,
            "list_volumes",
            "volumes",
            OpClass::Read,
            "volumes",
            move || async move {
                Ok(self.workloads()?.volumes().await?)
            },
        )
        .await
    }

    /// Aggregate runtime information.
    pub async fn system_info(&self, caller: &Caller) -> Response<RuntimeInfo> {
        self.run(
            caller,
            "system_info",
            "runtime",
            OpClass::AdminRead,
            "system info",
            move || async move {
                Ok(self.workloads()?.system_info().await?)
            },
        )
        .await
    }

    // ── Access lists ────────────────────────────────────────────

    /// Add to the allow list. Requires the credential.
    pub async fn allow_add(&self, caller: &Caller, entry: NewEntry) -> Response<AccessEntry> {
        self.add_entry(caller, ListKind::Allow, entry).await
    }

    /// Add to the deny list. Requires the credential.
    pub async fn deny_add(&self, caller: &Caller, entry: NewEntry) -> Response<AccessEntry> {
        self.add_entry(caller, ListKind::Deny, entry).await
    }

    /// Remove from the allow list. Requires the credential.
    pub async fn allow_remove(&self, caller: &Caller, pattern: &str) -> Response<AccessEntry> {
        self.remove_entry(caller, ListKind::Allow, pattern).await
    }

    /// Remove from the deny list. Requires the credential.
    pub async fn deny_remove(&self, caller: &Caller, pattern: &str) -> Response<AccessEntry> {
        self.remove_entry(caller, ListKind::Deny, pattern).await
    }

    /// Allow list snapshot.
    pub async fn allow_list(&self, caller: &Caller) -> Response<Vec<AccessEntry>> {
        self.list_entries(caller, ListKind::Allow).await
    }

    /// Deny list snapshot.
    pub async fn deny_list(&self, caller: &Caller) -> Response<Vec<AccessEntry>> {
        self.list_entries(caller, ListKind::Deny).await
    }

    /// Whether `ip` would be admitted by the access lists.
    pub async fn is_allowed(&self, caller: &Caller, ip: &str) -> Response<bool> {
        self.run(
            caller,
            "is_allowed",
            ip,
            OpClass::Read,
            "access decision",
            move || async move {
                if ip.trim().parse::<std::net::IpAddr>().is_err() {
                    return Err(ControlError::Validation(format!("{ip} is not an IP address")));
                }
                Ok(self.parts.access.is_allowed(ip).await)
            },
        )
        .await
    }

    /// Sweep expired entries from both lists. Requires the credential.
    pub async fn cleanup_expired(&self, caller: &Caller) -> Response<usize> {
        self.run(
            caller,
            "cleanup_expired",
            "access_lists",
            OpClass::Mutation,
            "expired entries removed",
            move || async move {
                Ok(self.parts.access.cleanup_expired().await?)
            },
        )
        .await
    }

    // ── Maintenance ─────────────────────────────────────────────

    /// Periodic housekeeping: expiry sweep and idle client pruning. Runs
    /// outside admission; failures are logged and the pass continues.
    pub async fn maintenance_tick(&self) -> MaintenanceReport {
        let expired_entries = match self.parts.access.cleanup_expired().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "expiry sweep failed");
                0
            }
        };
        let pruned_clients = self.parts.admission.prune_idle_clients();
        if expired_entries > 0 || pruned_clients > 0 {
            info!(expired_entries, pruned_clients, "maintenance pass completed");
        }
        MaintenanceReport {
            expired_entries,
            pruned_clients,
        }
    }

    /// Flush the audit trail. Call once at shutdown.
    pub fn shutdown(&self) {
        self.parts.audit.sync();
    }

    async fn add_entry(
        &self,
        caller: &Caller,
        kind: ListKind,
        entry: NewEntry,
    ) -> Response<AccessEntry> {
        let operation = match kind {
            ListKind::Allow => "allowlist_add",
            ListKind::Deny => "denylist_add",
        };
        let pattern = entry.pattern.clone();
        self.run(
            caller,
            operation,
            &pattern,
            OpClass::Mutation,
            "entry added",
            move || async move {
                Ok(self
                    .parts
                    .access
                    .add(
                        kind,
                        &entry.pattern,
                        &entry.description,
                        &caller.ctx.actor,
                        entry.expires_at,
                    )
                    .await?)
            },
        )
        .await
    }

    async fn remove_entry(
        &self,
        caller: &Caller,
        kind: ListKind,
        pattern: &str,
    ) -> Response<AccessEntry> {
        let operation = match kind {
            ListKind::Allow => "allowlist_remove",
            ListKind::Deny => "denylist_remove",
        };
        self.run(
            caller,
            operation,
            pattern,
            OpClass::Mutation,
            "entry removed",
            move || async move {
                Ok(self
                    .parts
                    .access
                    .remove(kind, pattern, &caller.ctx.actor)
                    .await?)
            },
        )
        .await
    }

    async fn list_entries(&self, caller: &Caller, kind: ListKind) -> Response<Vec<AccessEntry>> {
        let operation = match kind {
            ListKind::Allow => "allowlist_list",
            ListKind::Deny => "denylist_list",
        };
        self.run(
            caller,
            operation,
            kind.label(),
            OpClass::AdminRead,
            kind.label(),
            move || async move {
                Ok(self.parts.access.list(kind).await)
            },
        )
        .await
    }

    fn workloads(&self) -> Result<&WorkloadController, ControlError> {
        self.parts
            .workloads
            .as_deref()
            .ok_or(ControlError::NotConfigured("container runtime"))
    }

    fn authorized(&self, caller: &Caller) -> bool {
        let Some(presented) = caller.credential.as_deref() else {
            return false;
        };
        if self.api_key.is_empty() {
            return false;
        }
        presented.as_bytes().ct_eq(self.api_key.as_bytes()).into()
    }

    async fn run<T, F, Fut>(
        &self,
        caller: &Caller,
        operation: &str,
        resource: &str,
        class: OpClass,
        success_message: &str,
        body: F,
    ) -> Response<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ControlError>>,
    {
        let started = Instant::now();
        let ctx = &caller.ctx;
        let audit = &self.parts.audit;

        for &tier in class.tiers() {
            let decision = self.parts.admission.check(ctx, tier).await;
            if !decision.allowed {
                let elapsed = started.elapsed();
                audit.log_request(ctx, operation, resource, Some("rate limit exceeded"), elapsed);
                return Response::rate_limited(decision);
            }
        }

        if class == OpClass::Mutation && !self.authorized(caller) {
            let reason = if caller.credential.is_some() {
                "invalid credential"
            } else {
                "missing credential"
            };
            audit.log_auth_failure(ctx, reason);
            audit.log_request(ctx, operation, resource, Some(reason), started.elapsed());
            return Response::failure(FailureKind::Unauthorized, reason);
        }

        let result = body().await;
        let error = result.as_ref().err().map(ToString::to_string);
        audit.log_request(ctx, operation, resource, error.as_deref(), started.elapsed());
        match result {
            Ok(data) => Response::ok(success_message, data),
            Err(e) => {
                debug!(operation, resource, error = %e, "control operation failed");
                Response::failure(e.kind(), e.to_string())
            }
        }
    }
}
