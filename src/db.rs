use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::StoreConfig;

/// Initialize a connection pool to the PostgreSQL database holding the
/// event table. Connection limits come from `StoreConfig`.
pub async fn init_pool(database_url: &str, config: &StoreConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        acquire_timeout_secs = config.acquire_timeout_secs,
        "Connecting to Postgres..."
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(database_url)
        .await
}
