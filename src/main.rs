//! Harbormaster CLI entry point.
//!
//! One-shot operator subcommands plus `serve`, which runs periodic
//! maintenance until interrupted.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use harbormaster::access::{AccessListManager, SystemClock};
use harbormaster::admission::AdmissionController;
use harbormaster::audit::{AuditTrail, RequestContext};
use harbormaster::cache::{RedisCache, SharedCache};
use harbormaster::config::Config;
use harbormaster::control::{Caller, Components, ControlPlane, NewEntry, Response};
use harbormaster::health::postgres::PostgresProbe;
use harbormaster::health::HealthMonitor;
use harbormaster::invoker::ResilientInvoker;
use harbormaster::workload::{DockerRuntime, WorkloadController};

/// Harbormaster: single-host infrastructure control plane.
#[derive(Parser)]
#[command(name = "harbormaster", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Print the health report. Exits 1 when not ready.
    Check,
    /// List platform-managed containers.
    Containers,
    /// Manage the IP allow list.
    Allow {
        /// List operation.
        #[command(subcommand)]
        action: ListAction,
    },
    /// Manage the IP deny list.
    Deny {
        /// List operation.
        #[command(subcommand)]
        action: ListAction,
    },
    /// Ask whether an address would be admitted.
    Allowed {
        /// IPv4 or IPv6 address.
        ip: String,
    },
    /// Remove expired access entries.
    Cleanup,
    /// Run periodic maintenance until Ctrl-C.
    Serve {
        /// Seconds between maintenance passes.
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
}

/// Access list operations.
#[derive(Subcommand)]
enum ListAction {
    /// Show entries.
    List,
    /// Add an IP or CIDR.
    Add {
        /// IP address or CIDR range.
        pattern: String,
        /// Free-form note.
        #[arg(long, default_value = "")]
        description: String,
        /// Expiry as an RFC 3339 timestamp.
        #[arg(long, value_parser = parse_timestamp)]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Remove an entry.
    Remove {
        /// Pattern exactly as listed.
        pattern: String,
    },
}

impl Command {
    /// Commands that change access lists must leave a durable audit record.
    fn mutates(&self) -> bool {
        match self {
            Self::Allow { action } | Self::Deny { action } => !matches!(action, ListAction::List),
            Self::Cleanup => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy)]
enum List {
    Allow,
    Deny,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    let succeeded = match cli.command {
        Command::Serve { interval_secs } => handle_serve(&config, interval_secs).await?,
        command => {
            harbormaster::logging::init_cli(&config.logging.level);
            let audit = if command.mutates() {
                AuditTrail::rolling(&config.logging.audit_dir)
                    .context("failed to open audit trail")?
            } else {
                AuditTrail::tracing_only()
            };
            let audit = Arc::new(audit);
            let plane = assemble(&config, audit).await?;
            let outcome = handle_one_shot(&plane, &config, command).await;
            plane.shutdown();
            outcome?
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn handle_one_shot(
    plane: &ControlPlane,
    config: &Config,
    command: Command,
) -> anyhow::Result<bool> {
    let caller = operator(config);
    match command {
        Command::Check => handle_check(plane).await,
        Command::Containers => print_response(&plane.platform_services(&caller).await),
        Command::Allow { action } => handle_list(plane, &caller, List::Allow, action).await,
        Command::Deny { action } => handle_list(plane, &caller, List::Deny, action).await,
        Command::Allowed { ip } => print_response(&plane.is_allowed(&caller, &ip).await),
        Command::Cleanup => print_response(&plane.cleanup_expired(&caller).await),
        Command::Serve { .. } => Ok(true),
    }
}

/// Print the health report; success means ready.
async fn handle_check(plane: &ControlPlane) -> anyhow::Result<bool> {
    let caller = Caller::anonymous(RequestContext::new("cli"));
    let response = plane.health(&caller).await;
    print_response(&response)?;
    let ready = plane.readiness().await;
    if !ready {
        warn!("primary datastore unavailable, not ready");
    }
    Ok(ready)
}

async fn handle_list(
    plane: &ControlPlane,
    caller: &Caller,
    list: List,
    action: ListAction,
) -> anyhow::Result<bool> {
    match (list, action) {
        (List::Allow, ListAction::List) => print_response(&plane.allow_list(caller).await),
        (List::Deny, ListAction::List) => print_response(&plane.deny_list(caller).await),
        (
            list,
            ListAction::Add {
                pattern,
                description,
                expires_at,
            },
        ) => {
            let entry = NewEntry {
                pattern,
                description,
                expires_at,
            };
            let response = match list {
                List::Allow => plane.allow_add(caller, entry).await,
                List::Deny => plane.deny_add(caller, entry).await,
            };
            print_response(&response)
        }
        (List::Allow, ListAction::Remove { pattern }) => {
            print_response(&plane.allow_remove(caller, &pattern).await)
        }
        (List::Deny, ListAction::Remove { pattern }) => {
            print_response(&plane.deny_remove(caller, &pattern).await)
        }
    }
}

/// Run maintenance passes until Ctrl-C, then flush the audit trail.
async fn handle_serve(config: &Config, interval_secs: u64) -> anyhow::Result<bool> {
    let _logging_guard =
        harbormaster::logging::init_production(&config.logging.dir, &config.logging.level)?;
    let audit = Arc::new(
        AuditTrail::rolling(&config.logging.audit_dir).context("failed to open audit trail")?,
    );
    let plane = assemble(config, audit).await?;
    plane.mark_serving();
    info!(interval_secs, "harbormaster serving");

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                plane.maintenance_tick().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    plane.shutdown();
    info!("harbormaster stopped");
    Ok(true)
}

/// Wire every component from configuration. Optional dependencies that
/// cannot be reached are left out with a warning.
async fn assemble(config: &Config, audit: Arc<AuditTrail>) -> anyhow::Result<ControlPlane> {
    let cache = connect_cache(config).await;

    let admission = Arc::new(AdmissionController::new(
        &config.rate_limit,
        cache.clone(),
        Arc::clone(&audit),
    ));
    let access = Arc::new(
        AccessListManager::open(&config.access, Arc::clone(&audit), Arc::new(SystemClock))
            .await
            .context("failed to open access lists")?,
    );
    let workloads = match DockerRuntime::connect(&config.docker) {
        Ok(runtime) => Some(Arc::new(WorkloadController::new(
            Arc::new(runtime),
            &config.docker,
            Arc::clone(&audit),
        ))),
        Err(e) => {
            warn!(error = %e, "container runtime unavailable, container operations disabled");
            None
        }
    };
    let health = Arc::new(HealthMonitor::new(
        Arc::new(PostgresProbe::from_config(&config.database)),
        cache.clone(),
        Duration::from_secs(config.database.check_timeout_secs),
        config.server.version.clone(),
    ));
    let invoker = Arc::new(ResilientInvoker::new(
        &config.breaker,
        &config.retry,
        Arc::clone(&audit),
    ));

    let components = Components {
        admission,
        access,
        workloads,
        health,
        cache,
        invoker,
        audit,
    };
    Ok(ControlPlane::new(components, config.server.api_key.clone()))
}

async fn connect_cache(config: &Config) -> Option<Arc<dyn SharedCache>> {
    let url = config.cache.url.as_deref()?;
    match RedisCache::connect(url, config.cache.timeout()).await {
        Ok(cache) => Some(Arc::new(cache)),
        Err(e) => {
            warn!(error = %e, "shared cache unavailable, continuing without it");
            None
        }
    }
}

/// The CLI acts as the operator, presenting the configured credential.
fn operator(config: &Config) -> Caller {
    let actor = std::env::var("USER").unwrap_or_else(|_| "cli".to_owned());
    Caller::with_credential(RequestContext::new(actor), config.server.api_key.clone())
}

fn print_response<T: Serialize>(response: &Response<T>) -> anyhow::Result<bool> {
    let json = serde_json::to_string_pretty(response).context("failed to serialize response")?;
    println!("{json}");
    Ok(response.success)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}
