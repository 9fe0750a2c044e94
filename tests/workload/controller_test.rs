//! Tests for `src/workload/mod.rs` against an in-memory runtime.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harbormaster::audit::{AuditTrail, RequestContext};
use harbormaster::config::DockerConfig;
use harbormaster::workload::{
    ContainerRuntime, ContainerSnapshot, CpuSample, ImageSnapshot, LogQuery, NetworkSnapshot,
    RuntimeError, RuntimeInfo, StatsSample, VolumeSnapshot, WorkloadController, WorkloadError,
};

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedBuf {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Cursor::new(Vec::new()))))
    }

    fn events(&self) -> Vec<serde_json::Value> {
        let cursor = self.0.lock().expect("test lock");
        String::from_utf8_lossy(cursor.get_ref())
            .lines()
            .map(|l| serde_json::from_str(l).expect("audit line is json"))
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("test lock").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().expect("test lock").flush()
    }
}

fn container(name: &str, state: &str) -> ContainerSnapshot {
    ContainerSnapshot {
        id: format!("{:0<12}", name.len()),
        name: name.to_owned(),
        image: "nginx:1.27".to_owned(),
        state: state.to_owned(),
        status: format!("{state} for 3 minutes"),
        created_at: None,
        ports: Vec::new(),
        labels: BTreeMap::new(),
    }
}

/// In-memory runtime that counts lifecycle calls.
#[derive(Default)]
struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerSnapshot>>,
    calls: Mutex<Vec<String>>,
    fail_stop: bool,
    hang: bool,
    last_tail: Mutex<Option<String>>,
}

impl FakeRuntime {
    fn with(containers: &[ContainerSnapshot]) -> Self {
        Self {
            containers: Mutex::new(
                containers
                    .iter()
                    .map(|c| (c.name.clone(), c.clone()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("test lock").clone()
    }

    fn transition(&self, id: &str, call: &str, state: &str) -> Result<(), RuntimeError> {
        self.calls.lock().expect("test lock").push(format!("{call}:{id}"));
        let mut containers = self.containers.lock().expect("test lock");
        let c = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
        c.state = state.to_owned();
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self
            .containers
            .lock()
            .expect("test lock")
            .values()
            .filter(|c| all || c.state == "running")
            .cloned()
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot, RuntimeError> {
        self.containers
            .lock()
            .expect("test lock")
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.transition(id, "start", "running")
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        if self.fail_stop {
            self.calls.lock().expect("test lock").push(format!("stop:{id}"));
            return Err(RuntimeError::Api("container is restarting".to_owned()));
        }
        self.transition(id, "stop", "exited")
    }

    async fn restart_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.transition(id, "restart", "running")
    }

    async fn container_logs(&self, id: &str, query: &LogQuery) -> Result<String, RuntimeError> {
        self.inspect_container(id).await?;
        *self.last_tail.lock().expect("test lock") = Some(query.bounded_tail().to_string());
        Ok("line one\nline two\n".to_owned())
    }

    async fn stats_sample(&self, id: &str) -> Result<StatsSample, RuntimeError> {
        self.inspect_container(id).await?;
        Ok(StatsSample {
            name: id.to_owned(),
            previous_cpu: CpuSample {
                total_usage: 1_000,
                system_usage: 100_000,
                online_cpus: 4,
            },
            current_cpu: CpuSample {
                total_usage: 3_000,
                system_usage: 110_000,
                online_cpus: 4,
            },
            memory_usage: 256,
            memory_limit: 1_024,
            network_rx: 10,
            network_tx: 20,
            block_read: 30,
            block_write: 40,
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageSnapshot>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSnapshot>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSnapshot>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn system_info(&self) -> Result<RuntimeInfo, RuntimeError> {
        Ok(RuntimeInfo {
            containers: 3,
            ..RuntimeInfo::default()
        })
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

fn controller(runtime: Arc<FakeRuntime>, audit: &SharedBuf) -> WorkloadController {
    let config = DockerConfig {
        timeout_secs: 2,
        stop_grace_secs: 7,
        ..DockerConfig::default()
    };
    WorkloadController::new(
        runtime,
        &config,
        Arc::new(AuditTrail::from_writer(Box::new(audit.clone()))),
    )
}

fn sample_runtime() -> Arc<FakeRuntime> {
    Arc::new(FakeRuntime::with(&[
        container("harbor-api", "running"),
        container("harbor-worker", "exited"),
        container("postgres", "running"),
    ]))
}

#[tokio::test]
async fn list_includes_stopped_containers() {
    let audit = SharedBuf::new();
    let workloads = controller(sample_runtime(), &audit);
    let all = workloads.list_containers().await.expect("list");
    assert_eq!(all.len(), 3);
    assert!(all.iter().any(|c| c.state == "exited"));
}

#[tokio::test]
async fn platform_services_filter_by_prefix() {
    let audit = SharedBuf::new();
    let workloads = controller(sample_runtime(), &audit);
    let names: Vec<String> = workloads
        .platform_services()
        .await
        .expect("list")
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["harbor-api", "harbor-worker"]);
}

#[tokio::test]
async fn unknown_container_is_not_found() {
    let audit = SharedBuf::new();
    let workloads = controller(sample_runtime(), &audit);
    let err = workloads.describe("ghost").await.expect_err("unknown");
    assert!(matches!(err, WorkloadError::NotFound { ref id } if id == "ghost"));
}

#[tokio::test]
async fn stop_uses_default_grace_and_is_audited() {
    let runtime = sample_runtime();
    let audit = SharedBuf::new();
    let workloads = controller(runtime.clone(), &audit);
    let ctx = RequestContext::new("ops");

    workloads
        .stop(&ctx, "harbor-api", None)
        .await
        .expect("stop");

    let described = workloads.describe("harbor-api").await.expect("describe");
    assert_eq!(described.state, "exited");

    let events = audit.events();
    let stop = events
        .iter()
        .find(|e| e["action"] == "container_stop")
        .expect("stop audited");
    assert_eq!(stop["resource"], "harbor-api");
    assert_eq!(stop["success"], true);
    assert_eq!(stop["details"]["grace_secs"], 7);
    assert_eq!(stop["actor"], "ops");
}

#[tokio::test]
async fn failed_lifecycle_is_audited_and_not_retried() {
    let runtime = Arc::new(FakeRuntime {
        fail_stop: true,
        ..FakeRuntime::with(&[container("harbor-api", "running")])
    });
    let audit = SharedBuf::new();
    let workloads = controller(runtime.clone(), &audit);

    let err = workloads
        .stop(&RequestContext::new("ops"), "harbor-api", Some(Duration::from_secs(1)))
        .await
        .expect_err("runtime refuses");
    assert!(matches!(err, WorkloadError::Runtime { operation: "stop container", .. }));
    assert!(err.to_string().contains("container is restarting"));

    assert_eq!(runtime.calls(), vec!["stop:harbor-api".to_owned()]);
    let events = audit.events();
    let stop = events
        .iter()
        .find(|e| e["action"] == "container_stop")
        .expect("failure audited");
    assert_eq!(stop["success"], false);
    assert_eq!(stop["details"]["grace_secs"], 1);
}

#[tokio::test]
async fn start_and_restart_are_audited() {
    let runtime = sample_runtime();
    let audit = SharedBuf::new();
    let workloads = controller(runtime.clone(), &audit);
    let ctx = RequestContext::new("ops");

    workloads.start(&ctx, "harbor-worker").await.expect("start");
    workloads
        .restart(&ctx, "harbor-worker", None)
        .await
        .expect("restart");

    let actions: Vec<String> = audit
        .events()
        .iter()
        .map(|e| e["action"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(actions, vec!["container_start", "container_restart"]);
    assert_eq!(
        runtime.calls(),
        vec!["start:harbor-worker".to_owned(), "restart:harbor-worker".to_owned()]
    );
}

#[tokio::test]
async fn lifecycle_on_unknown_container_audits_failure() {
    let audit = SharedBuf::new();
    let workloads = controller(sample_runtime(), &audit);
    let err = workloads
        .start(&RequestContext::new("ops"), "ghost")
        .await
        .expect_err("unknown");
    assert!(matches!(err, WorkloadError::NotFound { .. }));
    let events = audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["success"], false);
}

#[tokio::test]
async fn invalid_reference_never_reaches_runtime() {
    let runtime = sample_runtime();
    let audit = SharedBuf::new();
    let workloads = controller(runtime.clone(), &audit);
    let err = workloads
        .start(&RequestContext::new("ops"), "../../etc")
        .await
        .expect_err("rejected");
    assert!(matches!(err, WorkloadError::Validation(_)));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn logs_tail_is_capped() {
    let runtime = sample_runtime();
    let audit = SharedBuf::new();
    let workloads = controller(runtime.clone(), &audit);
    let query = LogQuery {
        tail: Some(50_000),
        ..LogQuery::default()
    };
    let logs = workloads.logs("harbor-api", &query).await.expect("logs");
    assert!(logs.contains("line two"));
    assert_eq!(
        runtime.last_tail.lock().expect("test lock").as_deref(),
        Some("5000")
    );
}

#[tokio::test]
async fn stats_derive_percentages() {
    let audit = SharedBuf::new();
    let workloads = controller(sample_runtime(), &audit);
    let stats = workloads.stats("postgres").await.expect("stats");
    // 2_000 / 10_000 of the host across 4 cores.
    assert!((stats.cpu_percent - 80.0).abs() < 1e-9);
    assert!((stats.memory_percent - 25.0).abs() < 1e-9);
    assert_eq!(stats.network_tx, 20);
    assert_eq!(stats.block_write, 40);
}

#[tokio::test(start_paused = true)]
async fn hung_runtime_times_out() {
    let runtime = Arc::new(FakeRuntime {
        hang: true,
        ..FakeRuntime::default()
    });
    let audit = SharedBuf::new();
    let workloads = controller(runtime, &audit);
    let err = workloads.list_containers().await.expect_err("deadline");
    assert!(matches!(err, WorkloadError::Timeout { seconds: 2, .. }));
}

#[tokio::test]
async fn host_level_reads() {
    let audit = SharedBuf::new();
    let workloads = controller(sample_runtime(), &audit);
    assert!(workloads.ping().await);
    assert_eq!(workloads.system_info().await.expect("info").containers, 3);
    assert!(workloads.images().await.expect("images").is_empty());
    assert!(workloads.networks().await.expect("networks").is_empty());
    assert!(workloads.volumes().await.expect("volumes").is_empty());
}
