//! Shared cache used for cross-instance admission counting.
//!
//! [`SharedCache`] is the seam the admission controller and the health
//! monitor depend on; [`RedisCache`] is the production implementation over a
//! `redis` connection manager. Every command carries the configured deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::{debug, info};

/// Errors from the shared cache. All of them are transient.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The command did not finish within the deadline.
    #[error("cache command {command} timed out after {timeout_ms}ms")]
    Timeout {
        /// Command name.
        command: &'static str,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },
    /// The cache rejected the command or the connection failed.
    #[error("cache command {command} failed: {message}")]
    Command {
        /// Command name.
        command: &'static str,
        /// Error text from the client.
        message: String,
    },
}

/// Counters describing cache usage since startup.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    /// Commands issued.
    pub commands: u64,
    /// Commands that returned an error.
    pub errors: u64,
    /// Commands that hit the deadline.
    pub timeouts: u64,
}

/// Minimal cache surface used by the control plane.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Atomically increment `key`, returning the new value.
    async fn increment(&self, key: &str) -> Result<i64, CacheError>;

    /// Set a time-to-live on `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Usage counters.
    fn stats(&self) -> CacheStats;
}

/// Redis-backed [`SharedCache`].
pub struct RedisCache {
    manager: ConnectionManager,
    timeout: Duration,
    commands: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

impl RedisCache {
    /// Connect to `url`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the URL is invalid or the server is not
    /// reachable in time.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Command {
            command: "CONNECT",
            message: e.to_string(),
        })?;
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout {
                command: "CONNECT",
                timeout_ms: millis(timeout),
            })?
            .map_err(|e| CacheError::Command {
                command: "CONNECT",
                message: e.to_string(),
            })?;
        info!(timeout_ms = millis(timeout), "connected to shared cache");
        Ok(Self {
            manager,
            timeout,
            commands: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    /// Run one command under the deadline, updating the counters.
    async fn run<T: redis::FromRedisValue + Send>(
        &self,
        command: &'static str,
        cmd: redis::Cmd,
    ) -> Result<T, CacheError> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.manager.clone();
        match tokio::time::timeout(self.timeout, cmd.query_async(&mut conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                debug!(command, error = %e, "cache command failed");
                Err(CacheError::Command {
                    command,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Timeout {
                    command,
                    timeout_ms: millis(self.timeout),
                })
            }
        }
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.run("INCR", cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl.as_secs());
        let _: i64 = self.run("EXPIRE", cmd).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let _: String = self.run("PING", redis::cmd("PING")).await?;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            commands: self.commands.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
