//! Audit trail shared by every control-plane component.
//!
//! Each [`AuditEvent`] is written as one JSON line to an append-only sink and
//! mirrored as a `tracing` event with target `audit`. Client addresses are
//! masked before they are stored; the raw address never reaches the record.
//!
//! Logging is fire-and-forget. Serialisation or I/O failures are reported
//! through `tracing` and never surface to the audited operation.
//! [`AuditTrail::sync`] must be called at shutdown to flush buffered events.

pub mod mask;

use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

pub use mask::{mask_ip, UNKNOWN_IP};

// ── Request context ─────────────────────────────────────────────

/// Who is calling, as seen by the control surface.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Authenticated or self-declared caller name.
    pub actor: String,
    /// Caller address, if the transport exposed one.
    pub client_ip: Option<IpAddr>,
    /// Caller user agent, if any.
    pub user_agent: Option<String>,
    /// Identifier tying together every event of one request.
    pub correlation_id: String,
}

impl RequestContext {
    /// Create a context with a fresh correlation id.
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            client_ip: None,
            user_agent: None,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Attach the caller address.
    #[must_use]
    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Attach the caller user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

// ── Event ───────────────────────────────────────────────────────

/// A single immutable audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// When the event was built.
    pub timestamp: DateTime<Utc>,
    /// Machine-readable action name, e.g. `allowlist_add`.
    pub action: String,
    /// Who performed the action.
    pub actor: String,
    /// What the action targeted.
    pub resource: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Action-specific extra fields.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Network prefix of the caller address.
    pub masked_ip: String,
    /// Caller user agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Wall time spent on the action.
    pub duration_ms: u64,
    /// Request correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AuditEvent {
    /// Start a successful event with no caller context.
    pub fn new(
        action: impl Into<String>,
        actor: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            actor: actor.into(),
            resource: resource.into(),
            success: true,
            error: None,
            details: BTreeMap::new(),
            masked_ip: UNKNOWN_IP.to_owned(),
            user_agent: None,
            duration_ms: 0,
            correlation_id: None,
        }
    }

    /// Copy caller details from a request context, masking the address.
    #[must_use]
    pub fn with_context(mut self, ctx: &RequestContext) -> Self {
        self.masked_ip = ctx.client_ip.map_or_else(|| UNKNOWN_IP.to_owned(), mask_ip);
        self.user_agent.clone_from(&ctx.user_agent);
        self.correlation_id = Some(ctx.correlation_id.clone());
        self
    }

    /// Mark the event failed with the given error.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Mark failed when `error` is present.
    #[must_use]
    pub fn outcome(self, error: Option<&str>) -> Self {
        match error {
            Some(e) => self.failed(e),
            None => self,
        }
    }

    /// Add a detail field.
    #[must_use]
    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }

    /// Record how long the action took.
    #[must_use]
    pub fn took(mut self, elapsed: Duration) -> Self {
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

// ── Trail ───────────────────────────────────────────────────────

/// Append-only audit sink.
pub struct AuditTrail {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    guard: Mutex<Option<WorkerGuard>>,
}

impl AuditTrail {
    /// Audit trail that only emits `tracing` events.
    pub fn tracing_only() -> Self {
        Self {
            writer: Mutex::new(None),
            guard: Mutex::new(None),
        }
    }

    /// Audit trail writing `audit.log.YYYY-MM-DD` files under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn rolling(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            anyhow::anyhow!("failed to create audit directory {}: {e}", dir.display())
        })?;
        let appender = tracing_appender::rolling::daily(dir, "audit.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        Ok(Self {
            writer: Mutex::new(Some(Box::new(non_blocking))),
            guard: Mutex::new(Some(guard)),
        })
    }

    /// Audit trail over an arbitrary writer.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            guard: Mutex::new(None),
        }
    }

    /// Record an event. Never fails.
    pub fn log_event(&self, event: AuditEvent) {
        if event.success {
            info!(
                target: "audit",
                action = %event.action,
                actor = %event.actor,
                resource = %event.resource,
                masked_ip = %event.masked_ip,
                duration_ms = event.duration_ms,
                "audit event"
            );
        } else {
            warn!(
                target: "audit",
                action = %event.action,
                actor = %event.actor,
                resource = %event.resource,
                masked_ip = %event.masked_ip,
                error = event.error.as_deref().unwrap_or_default(),
                "audit event failed"
            );
        }

        if let Err(e) = self.write_line(&event) {
            debug!(error = %e, action = %event.action, "audit write dropped");
        }
    }

    /// Flush buffered events. Call once at shutdown.
    ///
    /// For rolling trails this also stops the background writer; events
    /// logged afterwards only reach `tracing`.
    pub fn sync(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            if let Some(w) = writer.as_mut() {
                if let Err(e) = w.flush() {
                    debug!(error = %e, "audit flush failed");
                }
            }
        }
        if let Ok(mut guard) = self.guard.lock() {
            drop(guard.take());
        }
    }

    fn write_line(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        if let Some(w) = writer.as_mut() {
            writeln!(w, "{line}")?;
            w.flush()?;
        }
        Ok(())
    }

    // ── Convenience wrappers ────────────────────────────────────

    /// Record one control-surface request.
    pub fn log_request(
        &self,
        ctx: &RequestContext,
        operation: &str,
        resource: &str,
        error: Option<&str>,
        elapsed: Duration,
    ) {
        self.log_event(
            AuditEvent::new("http_request", &ctx.actor, resource)
                .with_context(ctx)
                .outcome(error)
                .detail("operation", operation)
                .took(elapsed),
        );
    }

    /// Record one outbound integration call, whatever its business outcome.
    pub fn log_integration_call(
        &self,
        upstream: &str,
        operation: &str,
        error: Option<&str>,
        elapsed: Duration,
    ) {
        self.log_event(
            AuditEvent::new(
                format!("integration_{upstream}_{operation}"),
                "system",
                upstream,
            )
            .outcome(error)
            .took(elapsed),
        );
    }

    /// Record a credential refresh for an upstream integration.
    pub fn log_token_refresh(&self, service: &str, error: Option<&str>) {
        self.log_event(AuditEvent::new("token_refresh", "system", service).outcome(error));
    }

    /// Record a circuit breaker state change.
    pub fn log_breaker_transition(&self, upstream: &str, from: &str, to: &str) {
        self.log_event(
            AuditEvent::new("circuit_breaker_state_change", "system", upstream)
                .detail("from", from)
                .detail("to", to),
        );
    }

    /// Record an admission denial.
    pub fn log_rate_limit_exceeded(&self, ctx: &RequestContext, tier: &str, limit: u64) {
        self.log_event(
            AuditEvent::new("rate_limit_exceeded", &ctx.actor, tier)
                .with_context(ctx)
                .failed("rate limit exceeded")
                .detail("limit", limit),
        );
    }

    /// Record a rejected credential.
    pub fn log_auth_failure(&self, ctx: &RequestContext, reason: &str) {
        self.log_event(
            AuditEvent::new("auth_failure", &ctx.actor, "control_surface")
                .with_context(ctx)
                .failed(reason),
        );
    }
}
