//! Docker Engine binding for [`ContainerRuntime`], reached through the
//! capability-limited socket proxy.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogsOptions, RestartContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::image::ListImagesOptions;
use bollard::network::ListNetworksOptions;
use bollard::volume::ListVolumesOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use tokio_stream::StreamExt;
use tracing::debug;

use crate::config::DockerConfig;

use super::stats::CpuSample;
use super::{
    short_id, ContainerRuntime, ContainerSnapshot, ImageSnapshot, LogQuery, NetworkSnapshot,
    PortMapping, RuntimeError, RuntimeInfo, StatsSample, VolumeSnapshot,
};

/// Runtime backed by a Docker Engine API endpoint.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `config.host`. `tcp://` and `http://` go over HTTP,
    /// `unix://` over the socket; an empty host uses local defaults.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Api`] if the client cannot be built. No
    /// request is made; use [`ContainerRuntime::ping`] to probe.
    pub fn connect(config: &DockerConfig) -> Result<Self, RuntimeError> {
        let host = config.host.trim();
        let connected = if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, config.timeout_secs, API_DEFAULT_VERSION)
        } else if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, config.timeout_secs, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_local_defaults()
        };
        let docker = connected
            .map_err(|e| RuntimeError::Api(format!("failed to connect to {host}: {e}")))?;
        debug!(host, "docker client configured");
        Ok(Self { docker })
    }

    async fn first_snapshot(&self, full_id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let options = Some(ListContainersOptions {
            all: true,
            filters: HashMap::from([("id".to_owned(), vec![full_id.to_owned()])]),
            ..Default::default()
        });
        let containers = self
            .docker
            .list_containers(options)
            .await
            .map_err(|e| map_err("list containers", e))?;
        containers
            .into_iter()
            .next()
            .map(snapshot_from_summary)
            .ok_or_else(|| RuntimeError::NotFound(full_id.to_owned()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let options = Some(ListContainersOptions::<String> {
            all,
            ..Default::default()
        });
        let containers = self
            .docker
            .list_containers(options)
            .await
            .map_err(|e| map_err("list containers", e))?;
        Ok(containers.into_iter().map(snapshot_from_summary).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err("inspect container", e))?;
        let full_id = inspect
            .id
            .ok_or_else(|| RuntimeError::Api(format!("inspect of {id} returned no id")))?;
        self.first_snapshot(&full_id).await
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err("start container", e))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        self.docker
            .stop_container(id, Some(StopContainerOptions { t }))
            .await
            .map_err(|e| map_err("stop container", e))
    }

    async fn restart_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let t = isize::try_from(grace.as_secs()).unwrap_or(isize::MAX);
        self.docker
            .restart_container(id, Some(RestartContainerOptions { t }))
            .await
            .map_err(|e| map_err("restart container", e))
    }

    async fn container_logs(&self, id: &str, query: &LogQuery) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            since: query.since.map_or(0, |t| t.timestamp()),
            timestamps: query.timestamps,
            tail: query.bounded_tail().to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let line = chunk.map_err(|e| map_err("read logs", e))?;
            output.push_str(&line.to_string());
        }
        Ok(output)
    }

    async fn stats_sample(&self, id: &str) -> Result<StatsSample, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(sample_from_stats(&stats)),
            Some(Err(e)) => Err(map_err("read stats", e)),
            None => Err(RuntimeError::Api(format!("no stats returned for {id}"))),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageSnapshot>, RuntimeError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_err("list images", e))?;
        Ok(images
            .into_iter()
            .map(|image| ImageSnapshot {
                id: short_id(image.id.trim_start_matches("sha256:")),
                tags: image.repo_tags,
                size: image.size,
                created_at: DateTime::from_timestamp(image.created, 0),
            })
            .collect())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSnapshot>, RuntimeError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| map_err("list networks", e))?;
        Ok(networks
            .into_iter()
            .map(|n| NetworkSnapshot {
                id: short_id(n.id.as_deref().unwrap_or_default()),
                name: n.name.unwrap_or_default(),
                driver: n.driver.unwrap_or_default(),
                scope: n.scope.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSnapshot>, RuntimeError> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
            .map_err(|e| map_err("list volumes", e))?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeSnapshot {
                name: v.name,
                driver: v.driver,
                mountpoint: v.mountpoint,
                created_at: v.created_at,
            })
            .collect())
    }

    async fn system_info(&self) -> Result<RuntimeInfo, RuntimeError> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| map_err("read system info", e))?;
        Ok(RuntimeInfo {
            server_version: info.server_version.unwrap_or_default(),
            operating_system: info.operating_system.unwrap_or_default(),
            architecture: info.architecture.unwrap_or_default(),
            cpus: info.ncpu.unwrap_or_default(),
            memory_total: info.mem_total.unwrap_or_default(),
            containers: info.containers.unwrap_or_default(),
            containers_running: info.containers_running.unwrap_or_default(),
            containers_paused: info.containers_paused.unwrap_or_default(),
            containers_stopped: info.containers_stopped.unwrap_or_default(),
            images: info.images.unwrap_or_default(),
        })
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_err("ping runtime", e))
    }
}

/// 404 from the engine is a missing container; anything else is an API error.
fn map_err(operation: &str, e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::Api(format!("failed to {operation}: {other}")),
    }
}

fn snapshot_from_summary(c: bollard::models::ContainerSummary) -> ContainerSnapshot {
    let name = c
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_owned())
        .unwrap_or_default();
    let ports = c
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|p| PortMapping {
            ip: p.ip,
            private_port: p.private_port,
            public_port: p.public_port,
            protocol: p.typ.map(|t| t.to_string()).unwrap_or_else(|| "tcp".to_owned()),
        })
        .collect();

    ContainerSnapshot {
        id: short_id(c.id.as_deref().unwrap_or_default()),
        name,
        image: c.image.unwrap_or_default(),
        state: c.state.unwrap_or_default(),
        status: c.status.unwrap_or_default(),
        created_at: c.created.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        ports,
        labels: c
            .labels
            .unwrap_or_default()
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
    }
}

fn cpu_sample(stats: &bollard::container::CPUStats) -> CpuSample {
    let online = stats.online_cpus.or_else(|| {
        stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .and_then(|per_cpu| u64::try_from(per_cpu.len()).ok())
    });
    CpuSample {
        total_usage: stats.cpu_usage.total_usage,
        system_usage: stats.system_cpu_usage.unwrap_or_default(),
        online_cpus: online
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1),
    }
}

fn sample_from_stats(stats: &Stats) -> StatsSample {
    let (network_rx, network_tx) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values().fold((0u64, 0u64), |(rx, tx), n| {
                (rx.saturating_add(n.rx_bytes), tx.saturating_add(n.tx_bytes))
            })
        })
        .unwrap_or_default();

    let (block_read, block_write) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |(read, write), e| {
                match e.op.to_ascii_lowercase().as_str() {
                    "read" => (read.saturating_add(e.value), write),
                    "write" => (read, write.saturating_add(e.value)),
                    _ => (read, write),
                }
            })
        })
        .unwrap_or_default();

    StatsSample {
        name: stats.name.trim_start_matches('/').to_owned(),
        previous_cpu: cpu_sample(&stats.precpu_stats),
        current_cpu: cpu_sample(&stats.cpu_stats),
        memory_usage: stats.memory_stats.usage.unwrap_or_default(),
        memory_limit: stats.memory_stats.limit.unwrap_or_default(),
        network_rx,
        network_tx,
        block_read,
        block_write,
    }
}
