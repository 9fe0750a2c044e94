//! Primary datastore probe over `sqlx`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{DatastoreDetails, PrimaryProbe, ProbeError};
use crate::config::DatabaseConfig;

/// Opens a small short-lived pool per check, queries server details and
/// closes the pool again.
pub struct PostgresProbe {
    url: String,
    max_connections: u32,
    idle_lifetime: Duration,
    connect_timeout: Duration,
}

impl PostgresProbe {
    /// Build a probe from the `[database]` section.
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_connections: config.max_connections.max(1),
            idle_lifetime: Duration::from_secs(config.idle_lifetime_secs),
            connect_timeout: Duration::from_secs(config.check_timeout_secs),
        }
    }
}

#[async_trait]
impl PrimaryProbe for PostgresProbe {
    async fn probe(&self) -> Result<DatastoreDetails, ProbeError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .idle_timeout(self.idle_lifetime)
            .max_lifetime(self.idle_lifetime)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.url)
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        let details = query_details(&pool)
            .await
            .map_err(|e| ProbeError::Query(e.to_string()));
        pool.close().await;
        details
    }
}

async fn query_details(pool: &PgPool) -> Result<DatastoreDetails, sqlx::Error> {
    let version: String = sqlx::query_scalar("SELECT version()")
        .fetch_one(pool)
        .await?;

    let (active_connections, max_connections): (i64, i64) = sqlx::query_as(
        "SELECT (SELECT count(*) FROM pg_stat_activity), \
         current_setting('max_connections')::bigint",
    )
    .fetch_one(pool)
    .await?;

    let size: String =
        sqlx::query_scalar("SELECT pg_size_pretty(pg_database_size(current_database()))")
            .fetch_one(pool)
            .await?;

    Ok(DatastoreDetails {
        version,
        active_connections,
        max_connections,
        size,
    })
}
