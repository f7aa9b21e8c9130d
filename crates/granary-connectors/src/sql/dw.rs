//! Data Warehouse destination engine and health-check helpers.
//!
//! The DW is a PostgreSQL backend resolved from `DW_`-prefixed environment
//! variables (or an explicit config map) and shared through the connection
//! cache under its own connection type.

use granary_core::engine::get_or_create_engine;
use granary_core::{DbEngine, EtlError, JsonMap};

use super::postgres::{build_postgres_url, identity, resolve};

/// Create or reuse the destination DW engine.
pub async fn get_dw_engine(config: Option<&JsonMap>, reuse: bool) -> Result<DbEngine, EtlError> {
    let resolved = resolve(config, "DW")?;
    let url = build_postgres_url(&resolved)?;
    let timeout = resolved.connect_timeout_seconds;
    get_or_create_engine(
        "dw_postgres",
        &identity(&resolved),
        || async move { DbEngine::connect(&url, timeout).await },
        reuse,
    )
    .await
}

/// Run a lightweight `SELECT 1` against the destination DW connection.
pub async fn test_dw_connection(config: Option<&JsonMap>) -> bool {
    match get_dw_engine(config, true).await {
        Ok(engine) => engine.health_check().await.is_ok(),
        Err(_) => false,
    }
}
