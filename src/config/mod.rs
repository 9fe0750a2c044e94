//! Configuration loading.
//!
//! Loads harbormaster configuration from `./harbormaster.toml` (or
//! `$HARBOR_CONFIG_PATH`). Environment variables override file values; file
//! values override defaults.
//!
//! Precedence: env vars > config file > defaults.
//!
//! The resulting [`Config`] is built once at startup and handed to each
//! component by reference. Nothing reads configuration from globals.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level harbormaster configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control surface settings (`[server]`).
    pub server: ServerConfig,
    /// Log output settings (`[logging]`).
    pub logging: LoggingConfig,
    /// Shared cache connection (`[cache]`).
    pub cache: CacheConfig,
    /// Primary datastore connection (`[database]`).
    pub database: DatabaseConfig,
    /// Admission control tiers (`[rate_limit]`).
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker thresholds (`[breaker]`).
    pub breaker: BreakerConfig,
    /// Outbound retry policy (`[retry]`).
    pub retry: RetryConfig,
    /// Container runtime API (`[docker]`).
    pub docker: DockerConfig,
    /// Reverse-proxy access list sync (`[access]`).
    pub access: AccessConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$HARBOR_CONFIG_PATH` or `./harbormaster.toml`.
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the merged configuration fails [`Config::validate`].
    pub fn load() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string without env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("failed to parse config TOML")
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file(path: &PathBuf) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve config path using a custom env resolver.
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("HARBOR_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("harbormaster.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("HARBOR_API_KEY") {
            self.server.api_key = v;
        }
        if let Some(v) = env("HARBOR_LOG_LEVEL") {
            self.logging.level = v;
        }

        // Dependencies.
        if let Some(v) = env("HARBOR_CACHE_URL") {
            self.cache.url = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = env("HARBOR_DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = env("HARBOR_DOCKER_HOST") {
            self.docker.host = v;
        }
        if let Some(v) = env("HARBOR_PROXY_CONFIG") {
            self.access.proxy_config_path = PathBuf::from(v);
        }

        // Admission.
        override_parsed(&env, "HARBOR_GLOBAL_RPS", &mut self.rate_limit.global_rps);
        override_parsed(&env, "HARBOR_ADMIN_RPS", &mut self.rate_limit.admin_rps);
        override_parsed(
            &env,
            "HARBOR_DISTRIBUTED_RATE_LIMIT",
            &mut self.rate_limit.distributed,
        );
    }

    /// Reject configurations no component can run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.server.api_key.trim().is_empty() {
            anyhow::bail!("server.api_key is required (or set HARBOR_API_KEY)");
        }
        if self.rate_limit.global_rps == 0 || self.rate_limit.admin_rps == 0 {
            anyhow::bail!("rate_limit.global_rps and rate_limit.admin_rps must be positive");
        }
        if self.rate_limit.per_client_rps == 0 {
            anyhow::bail!("rate_limit.per_client_rps must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.request_timeout_secs == 0 {
            anyhow::bail!("retry.request_timeout_secs must be positive");
        }
        if self.retry.wait_min_ms > self.retry.wait_max_ms {
            anyhow::bail!("retry.wait_min_ms must not exceed retry.wait_max_ms");
        }
        if self.breaker.failure_threshold == 0 || self.breaker.max_requests == 0 {
            anyhow::bail!("breaker.failure_threshold and breaker.max_requests must be positive");
        }
        if self.docker.host.trim().is_empty() {
            anyhow::bail!("docker.host is required");
        }
        if self.access.middleware.trim().is_empty() {
            anyhow::bail!("access.middleware is required");
        }
        Ok(())
    }
}

/// Parse an env override into `slot`, warning and keeping the old value on
/// malformed input.
fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
) {
    if let Some(v) = env(var) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, value = %v, "ignoring invalid env override"),
        }
    }
}

// ── Sections ────────────────────────────────────────────────────

/// Control surface settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Pre-shared credential required by mutating operations.
    pub api_key: String,
    /// Version label reported by health checks.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs.
    pub dir: PathBuf,
    /// Directory for the rotated audit trail.
    pub audit_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: PathBuf::from("logs"),
            audit_dir: PathBuf::from("logs/audit"),
        }
    }
}

/// Shared cache connection. `url = None` means "not configured".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection string.
    pub url: Option<String>,
    /// Per-command deadline in milliseconds.
    pub timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 2_000,
        }
    }
}

impl CacheConfig {
    /// Per-command deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Primary datastore connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection string.
    pub url: String,
    /// Deadline for one health check, in seconds.
    pub check_timeout_secs: u64,
    /// Pool size used by health checks.
    pub max_connections: u32,
    /// Idle lifetime of pooled connections, in seconds.
    pub idle_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://harbormaster@localhost:5432/harbormaster".to_owned(),
            check_timeout_secs: 5,
            max_connections: 2,
            idle_lifetime_secs: 10,
        }
    }
}

/// Admission control tiers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per second for the global tier.
    pub global_rps: u32,
    /// Requests per second for the admin tier.
    pub admin_rps: u32,
    /// Global burst capacity. The admin tier gets half of it.
    pub burst: u32,
    /// Use the shared cache for cross-instance counting when configured.
    pub distributed: bool,
    /// Requests per second per caller IP.
    pub per_client_rps: u32,
    /// Burst capacity per caller IP.
    pub per_client_burst: u32,
    /// Upper bound on tracked caller IPs before LRU eviction.
    pub max_tracked_clients: usize,
    /// Idle time after which a caller's bucket is pruned, in seconds.
    pub client_idle_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rps: 100,
            admin_rps: 20,
            burst: 50,
            distributed: true,
            per_client_rps: 10,
            per_client_burst: 20,
            max_tracked_clients: 10_000,
            client_idle_secs: 600,
        }
    }
}

/// Circuit breaker thresholds, shared by every upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Trial calls admitted while half-open.
    pub max_requests: u32,
    /// Closed-state counter reset window, in seconds. Zero disables resets.
    pub interval_secs: u64,
    /// Time spent open before probing, in seconds.
    pub cooldown_secs: u64,
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 3,
            interval_secs: 10,
            cooldown_secs: 30,
            failure_threshold: 5,
        }
    }
}

/// Outbound retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Lower backoff bound in milliseconds.
    pub wait_min_ms: u64,
    /// Upper backoff bound in milliseconds.
    pub wait_max_ms: u64,
    /// Per-attempt HTTP timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            wait_min_ms: 500,
            wait_max_ms: 30_000,
            request_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    /// Per-attempt HTTP deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Container runtime API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// `tcp://`, `http://` or `unix://` endpoint of the socket proxy.
    pub host: String,
    /// Deadline for each runtime call, in seconds.
    pub timeout_secs: u64,
    /// Grace period for stop/restart when the caller gives none.
    pub stop_grace_secs: u64,
    /// Name prefix marking platform-managed containers.
    pub name_prefix: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: "tcp://docker-socket-proxy:2375".to_owned(),
            timeout_secs: 30,
            stop_grace_secs: 10,
            name_prefix: "harbor-".to_owned(),
        }
    }
}

/// Reverse-proxy access list sync.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Dynamic configuration file watched by the reverse proxy.
    pub proxy_config_path: PathBuf,
    /// Name of the middleware holding the `sourceRange` list.
    pub middleware: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            proxy_config_path: PathBuf::from("configs/proxy-dynamic.toml"),
            middleware: "dynamic-ipallowlist".to_owned(),
        }
    }
}
