//! SQLite source connector.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::engine::get_or_create_engine;
use granary_core::{DbEngine, EtlError, IngestionResult, JsonMap};

use super::SqlConnection;
use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    pub database_path: String,
    #[serde(default = "default_timeout", deserialize_with = "de::lenient_u64")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_reuse", deserialize_with = "de::lenient_bool")]
    pub reuse: bool,
}

fn default_timeout() -> u64 {
    30
}

fn default_reuse() -> bool {
    true
}

pub fn build_sqlite_url(database_path: &str) -> String {
    if database_path == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{}?mode=rwc", database_path)
    }
}

fn resolve(config: Option<&JsonMap>) -> Result<SqliteConfig, EtlError> {
    let layers = ConfigLayers {
        env_prefix: Some("SQLITE".to_string()),
        ..Default::default()
    };
    let merged = load_connection_config(config, &layers, &["database_path"])?;
    typed_config("sqlite", &merged)
}

fn identity(config: &SqliteConfig) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("database_path".to_string(), json!(config.database_path));
    map
}

/// Create or reuse the cached SQLite engine for this database path.
pub async fn get_sqlite_engine(config: Option<&JsonMap>, reuse: bool) -> Result<DbEngine, EtlError> {
    let resolved = resolve(config)?;
    let url = build_sqlite_url(&resolved.database_path);
    let timeout = resolved.connect_timeout_seconds;
    get_or_create_engine(
        "sqlite",
        &identity(&resolved),
        || async move { DbEngine::connect(&url, timeout).await },
        reuse,
    )
    .await
}

/// Run `SELECT 1` against the configured database.
pub async fn test_sqlite_connection(config: Option<&JsonMap>) -> bool {
    match get_sqlite_engine(config, true).await {
        Ok(engine) => engine.health_check().await.is_ok(),
        Err(_) => false,
    }
}

pub struct SqliteConnector {
    conn: SqlConnection,
}

impl SqliteConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let config = resolve(Some(payload))?;
        Ok(Self {
            conn: SqlConnection::new(
                "sqlite",
                "sqlite",
                build_sqlite_url(&config.database_path),
                identity(&config),
                config.connect_timeout_seconds,
                config.reuse,
            ),
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(SqliteConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for SqliteConnector {
    fn protocol(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        self.conn.connect().await
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        self.conn.fetch(query).await
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_path_maps_to_memory_url() {
        assert_eq!(build_sqlite_url(":memory:"), "sqlite::memory:");
    }

    #[test]
    fn file_path_creates_if_missing() {
        assert_eq!(
            build_sqlite_url("/data/lake.db"),
            "sqlite:///data/lake.db?mode=rwc"
        );
    }

    #[test]
    fn missing_database_path_is_reported() {
        let err = resolve(Some(&JsonMap::new())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required connection config keys: database_path"
        );
    }
}
