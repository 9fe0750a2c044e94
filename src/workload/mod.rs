//! Container supervision through a restricted runtime API.
//!
//! Only read and lifecycle operations are exposed: no image builds, no exec.
//! Every runtime call carries the configured deadline. Lifecycle operations
//! are never retried, since repeating a start or stop against a container
//! that is already transitioning can double-apply, and each one is audited
//! with its target and outcome.

pub mod docker;
pub mod stats;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditTrail, RequestContext};
use crate::config::DockerConfig;

pub use docker::DockerRuntime;
pub use stats::{cpu_percent, memory_percent, CpuSample};

/// Log lines returned when the caller gives no tail.
pub const DEFAULT_LOG_TAIL: u32 = 100;

/// Upper bound on log lines per request.
pub const MAX_LOG_TAIL: u32 = 5_000;

/// Errors reported by a [`ContainerRuntime`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime does not know the container.
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other runtime API failure.
    #[error("{0}")]
    Api(String),
}

/// Errors from [`WorkloadController`] operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    /// Empty or malformed container reference.
    #[error("invalid container reference: {0}")]
    Validation(String),
    /// Unknown container.
    #[error("container {id} not found")]
    NotFound {
        /// Id or name as given by the caller.
        id: String,
    },
    /// The runtime rejected or failed the call.
    #[error("failed to {operation} {target}: {message}")]
    Runtime {
        /// Operation being attempted.
        operation: &'static str,
        /// Container id, or `runtime` for host-level calls.
        target: String,
        /// Runtime error text.
        message: String,
    },
    /// The runtime did not answer within the deadline.
    #[error("{operation} on {target} timed out after {seconds}s")]
    Timeout {
        /// Operation being attempted.
        operation: &'static str,
        /// Container id, or `runtime` for host-level calls.
        target: String,
        /// Deadline that elapsed.
        seconds: u64,
    },
}

/// Published port of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    /// Host address the port is bound on.
    pub ip: Option<String>,
    /// Port inside the container.
    pub private_port: u16,
    /// Port on the host, if published.
    pub public_port: Option<u16>,
    /// `tcp`, `udp` or `sctp`.
    pub protocol: String,
}

/// Read-only projection of a container, fetched fresh on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSnapshot {
    /// Short (12 character) id.
    pub id: String,
    /// Primary name without the leading `/`.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Machine state, e.g. `running` or `exited`.
    pub state: String,
    /// Human-readable status line.
    pub status: String,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
}

/// Local image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSnapshot {
    /// Short id.
    pub id: String,
    /// Repository tags.
    pub tags: Vec<String>,
    /// Size in bytes.
    pub size: i64,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
}

/// Runtime network.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkSnapshot {
    /// Short id.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Driver, e.g. `bridge`.
    pub driver: String,
    /// `local`, `global` or `swarm`.
    pub scope: String,
}

/// Named volume.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeSnapshot {
    /// Volume name.
    pub name: String,
    /// Volume driver.
    pub driver: String,
    /// Host mount point.
    pub mountpoint: String,
    /// Creation time as reported by the runtime.
    pub created_at: Option<String>,
}

/// Aggregate runtime information.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeInfo {
    /// Engine version.
    pub server_version: String,
    /// Host operating system.
    pub operating_system: String,
    /// Host architecture.
    pub architecture: String,
    /// Host CPU count.
    pub cpus: i64,
    /// Host memory in bytes.
    pub memory_total: i64,
    /// Containers in any state.
    pub containers: i64,
    /// Running containers.
    pub containers_running: i64,
    /// Paused containers.
    pub containers_paused: i64,
    /// Stopped containers.
    pub containers_stopped: i64,
    /// Local images.
    pub images: i64,
}

/// Raw counters from one stats read: the current sample and the one
/// preceding it.
#[derive(Debug, Clone, Default)]
pub struct StatsSample {
    /// Container name.
    pub name: String,
    /// CPU counters of the preceding sample.
    pub previous_cpu: CpuSample,
    /// CPU counters of the current sample.
    pub current_cpu: CpuSample,
    /// Memory in use, in bytes.
    pub memory_usage: u64,
    /// Memory limit, in bytes.
    pub memory_limit: u64,
    /// Bytes received over all interfaces.
    pub network_rx: u64,
    /// Bytes sent over all interfaces.
    pub network_tx: u64,
    /// Bytes read from block devices.
    pub block_read: u64,
    /// Bytes written to block devices.
    pub block_write: u64,
}

/// Derived resource usage of a container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStats {
    /// Container id as requested.
    pub id: String,
    /// Container name.
    pub name: String,
    /// CPU usage in `[0, 100 * cores]`.
    pub cpu_percent: f64,
    /// Memory in use, in bytes.
    pub memory_usage: u64,
    /// Memory limit, in bytes.
    pub memory_limit: u64,
    /// Memory usage in `[0, 100]`.
    pub memory_percent: f64,
    /// Bytes received.
    pub network_rx: u64,
    /// Bytes sent.
    pub network_tx: u64,
    /// Bytes read from block devices.
    pub block_read: u64,
    /// Bytes written to block devices.
    pub block_write: u64,
    /// When the sample was taken.
    pub read_at: DateTime<Utc>,
}

/// Log tail request.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Number of trailing lines; defaults to [`DEFAULT_LOG_TAIL`].
    pub tail: Option<u32>,
    /// Only lines after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Prefix each line with its timestamp.
    pub timestamps: bool,
}

impl LogQuery {
    /// Requested tail clamped to `1..=MAX_LOG_TAIL`.
    pub fn bounded_tail(&self) -> u32 {
        self.tail.unwrap_or(DEFAULT_LOG_TAIL).clamp(1, MAX_LOG_TAIL)
    }
}

/// The subset of a container runtime API the controller needs.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers, including stopped ones when `all` is set.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>, RuntimeError>;
    /// One container by id or name.
    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError>;
    /// Start a container.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;
    /// Stop a container, killing it after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    /// Restart a container, killing it after `grace`.
    async fn restart_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    /// Log lines as text.
    async fn container_logs(&self, id: &str, query: &LogQuery) -> Result<String, RuntimeError>;
    /// One stats read carrying two adjacent CPU samples.
    async fn stats_sample(&self, id: &str) -> Result<StatsSample, RuntimeError>;
    /// Local images.
    async fn list_images(&self) -> Result<Vec<ImageSnapshot>, RuntimeError>;
    /// Networks.
    async fn list_networks(&self) -> Result<Vec<NetworkSnapshot>, RuntimeError>;
    /// Volumes.
    async fn list_volumes(&self) -> Result<Vec<VolumeSnapshot>, RuntimeError>;
    /// Aggregate runtime information.
    async fn system_info(&self) -> Result<RuntimeInfo, RuntimeError>;
    /// Reachability probe.
    async fn ping(&self) -> Result<(), RuntimeError>;
}

/// Container lifecycle, stats and inspection.
pub struct WorkloadController {
    runtime: Arc<dyn ContainerRuntime>,
    audit: Arc<AuditTrail>,
    deadline: Duration,
    default_grace: Duration,
    name_prefix: String,
}

impl WorkloadController {
    /// Build a controller over `runtime`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: &DockerConfig,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            runtime,
            audit,
            deadline: Duration::from_secs(config.timeout_secs.max(1)),
            default_grace: Duration::from_secs(config.stop_grace_secs),
            name_prefix: config.name_prefix.clone(),
        }
    }

    /// All containers, including stopped ones.
    ///
    /// # Errors
    ///
    /// [`WorkloadError::Runtime`] or [`WorkloadError::Timeout`].
    pub async fn list_containers(&self) -> Result<Vec<ContainerSnapshot>, WorkloadError> {
        self.guarded("list containers", "runtime", self.runtime.list_containers(true))
            .await
    }

    /// Containers whose name carries the platform prefix.
    ///
    /// # Errors
    ///
    /// See [`WorkloadController::list_containers`].
    pub async fn platform_services(&self) -> Result<Vec<ContainerSnapshot>, WorkloadError> {
        let mut containers = self.list_containers().await?;
        containers.retain(|c| c.name.starts_with(&self.name_prefix));
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    /// One container by id or name.
    ///
    /// # Errors
    ///
    /// [`WorkloadError::NotFound`] for an unknown container.
    pub async fn describe(&self, id: &str) -> Result<ContainerSnapshot, WorkloadError> {
        let id = container_ref(id)?;
        self.guarded("inspect container", id, self.runtime.inspect_container(id))
            .await
    }

    /// Start a container. Audited as `container_start`.
    ///
    /// # Errors
    ///
    /// See [`WorkloadController::describe`].
    pub async fn start(&self, ctx: &RequestContext, id: &str) -> Result<(), WorkloadError> {
        let id = container_ref(id)?;
        let started = Instant::now();
        let result = self
            .guarded("start container", id, self.runtime.start_container(id))
            .await;
        self.record_lifecycle(ctx, "container_start", id, None, &result, started);
        result
    }

    /// Stop a container, waiting `grace` (or the configured default) before
    /// killing it. Audited as `container_stop`.
    ///
    /// # Errors
    ///
    /// See [`WorkloadController::describe`].
    pub async fn stop(
        &self,
        ctx: &RequestContext,
        id: &str,
        grace: Option<Duration>,
    ) -> Result<(), WorkloadError> {
        let id = container_ref(id)?;
        let grace = grace.unwrap_or(self.default_grace);
        let started = Instant::now();
        let result = self
            .guarded_with_grace("stop container", id, grace, self.runtime.stop_container(id, grace))
            .await;
        self.record_lifecycle(ctx, "container_stop", id, Some(grace), &result, started);
        result
    }

    /// Restart a container. Audited as `container_restart`.
    ///
    /// # Errors
    ///
    /// See [`WorkloadController::describe`].
    pub async fn restart(
        &self,
        ctx: &RequestContext,
        id: &str,
        grace: Option<Duration>,
    ) -> Result<(), WorkloadError> {
        let id = container_ref(id)?;
        let grace = grace.unwrap_or(self.default_grace);
        let started = Instant::now();
        let result = self
            .guarded_with_grace(
                "restart container",
                id,
                grace,
                self.runtime.restart_container(id, grace),
            )
            .await;
        self.record_lifecycle(ctx, "container_restart", id, Some(grace), &result, started);
        result
    }

    /// Bounded log tail.
    ///
    /// # Errors
    ///
    /// See [`WorkloadController::describe`].
    pub async fn logs(&self, id: &str, query: &LogQuery) -> Result<String, WorkloadError> {
        let id = container_ref(id)?;
        self.guarded("read logs", id, self.runtime.container_logs(id, query))
            .await
    }

    /// One live stats sample with derived percentages.
    ///
    /// # Errors
    ///
    /// See [`WorkloadController::describe`].
    pub async fn stats(&self, id: &str) -> Result<ContainerStats, WorkloadError> {
        let id = container_ref(id)?;
        let sample = self
            .guarded("read stats", id, self.runtime.stats_sample(id))
            .await?;
        Ok(ContainerStats {
            id: id.to_owned(),
            name: sample.name,
            cpu_percent: cpu_percent(&sample.previous_cpu, &sample.current_cpu),
            memory_usage: sample.memory_usage,
            memory_limit: sample.memory_limit,
            memory_percent: memory_percent(sample.memory_usage, sample.memory_limit),
            network_rx: sample.network_rx,
            network_tx: sample.network_tx,
            block_read: sample.block_read,
            block_write: sample.block_write,
            read_at: Utc::now(),
        })
    }

    /// Local images.
    ///
    /// # Errors
    ///
    /// [`WorkloadError::Runtime`] or [`WorkloadError::Timeout`].
    pub async fn images(&self) -> Result<Vec<ImageSnapshot>, WorkloadError> {
        self.guarded("list images", "runtime", self.runtime.list_images())
            .await
    }

    /// Networks.
    ///
    /// # Errors
    ///
    /// [`WorkloadError::Runtime`] or [`WorkloadError::Timeout`].
    pub async fn networks(&self) -> Result<Vec<NetworkSnapshot>, WorkloadError> {
        self.guarded("list networks", "runtime", self.runtime.list_networks())
            .await
    }

    /// Volumes.
    ///
    /// # Errors
    ///
    /// [`WorkloadError::Runtime`] or [`WorkloadError::Timeout`].
    pub async fn volumes(&self) -> Result<Vec<VolumeSnapshot>, WorkloadError> {
        self.guarded("list volumes", "runtime", self.runtime.list_volumes())
            .await
    }

    /// Aggregate runtime information.
    ///
    /// # Errors
    ///
    /// [`WorkloadError::Runtime`] or [`WorkloadError::Timeout`].
    pub async fn system_info(&self) -> Result<RuntimeInfo, WorkloadError> {
        self.guarded("read system info", "runtime", self.runtime.system_info())
            .await
    }

    /// Whether the runtime answers within the deadline.
    pub async fn ping(&self) -> bool {
        match self.guarded("ping", "runtime", self.runtime.ping()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "container runtime unreachable");
                false
            }
        }
    }

    async fn guarded<T, F>(
        &self,
        operation: &'static str,
        target: &str,
        call: F,
    ) -> Result<T, WorkloadError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        self.run_with_deadline(operation, target, self.deadline, call)
            .await
    }

    /// Stop and restart may legitimately take the whole grace period.
    async fn guarded_with_grace<T, F>(
        &self,
        operation: &'static str,
        target: &str,
        grace: Duration,
        call: F,
    ) -> Result<T, WorkloadError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        let deadline = self.deadline.saturating_add(grace);
        self.run_with_deadline(operation, target, deadline, call)
            .await
    }

    async fn run_with_deadline<T, F>(
        &self,
        operation: &'static str,
        target: &str,
        deadline: Duration,
        call: F,
    ) -> Result<T, WorkloadError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(RuntimeError::NotFound(_))) => Err(WorkloadError::NotFound {
                id: target.to_owned(),
            }),
            Ok(Err(RuntimeError::Api(message))) => Err(WorkloadError::Runtime {
                operation,
                target: target.to_owned(),
                message,
            }),
            Err(_) => Err(WorkloadError::Timeout {
                operation,
                target: target.to_owned(),
                seconds: deadline.as_secs(),
            }),
        }
    }

    fn record_lifecycle(
        &self,
        ctx: &RequestContext,
        action: &str,
        id: &str,
        grace: Option<Duration>,
        result: &Result<(), WorkloadError>,
        started: Instant,
    ) {
        let error = result.as_ref().err().map(ToString::to_string);
        if error.is_none() {
            info!(action, container = id, "container lifecycle operation completed");
        }
        let mut event = AuditEvent::new(action, ctx.actor.as_str(), id)
            .with_context(ctx)
            .outcome(error.as_deref())
            .took(started.elapsed());
        if let Some(grace) = grace {
            event = event.detail("grace_secs", grace.as_secs());
        }
        self.audit.log_event(event);
    }
}

/// Shorten a runtime id to its 12-character display form.
pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

fn container_ref(id: &str) -> Result<&str, WorkloadError> {
    let id = id.trim().trim_start_matches('/');
    if id.is_empty() {
        return Err(WorkloadError::Validation("empty container id".to_owned()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(WorkloadError::Validation(format!(
            "{id} is not a container id or name"
        )));
    }
    Ok(id)
}
