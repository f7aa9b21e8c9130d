//! PostgreSQL source connector.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::engine::get_or_create_engine;
use granary_core::{DbEngine, EtlError, IngestionResult, JsonMap};

use super::SqlConnection;
use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "de::lenient_u16")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout", deserialize_with = "de::lenient_u64")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_reuse", deserialize_with = "de::lenient_bool")]
    pub reuse: bool,
}

fn default_port() -> u16 {
    5432
}

fn default_timeout() -> u64 {
    30
}

fn default_reuse() -> bool {
    true
}

pub(crate) const REQUIRED_KEYS: &[&str] = &["host", "database", "username", "password"];

/// Build a `postgres://` URL with credentials percent-encoded.
pub fn build_postgres_url(config: &PostgresConfig) -> Result<String, EtlError> {
    let mut url = Url::parse("postgres://localhost")
        .map_err(|e| EtlError::InvalidConfig(e.to_string()))?;
    url.set_host(Some(&config.host))
        .map_err(|_| EtlError::InvalidConfig(format!("invalid host '{}'", config.host)))?;
    url.set_port(Some(config.port))
        .map_err(|_| EtlError::InvalidConfig(format!("invalid port {}", config.port)))?;
    url.set_path(&config.database);
    url.set_username(&config.username)
        .map_err(|_| EtlError::InvalidConfig("invalid username".to_string()))?;
    url.set_password(Some(&config.password))
        .map_err(|_| EtlError::InvalidConfig("invalid password".to_string()))?;
    Ok(url.to_string())
}

pub(crate) fn resolve(
    config: Option<&JsonMap>,
    env_prefix: &str,
) -> Result<PostgresConfig, EtlError> {
    let layers = ConfigLayers {
        env_prefix: Some(env_prefix.to_string()),
        ..Default::default()
    };
    let merged = load_connection_config(config, &layers, REQUIRED_KEYS)?;
    typed_config("postgres", &merged)
}

pub(crate) fn identity(config: &PostgresConfig) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("host".to_string(), json!(config.host));
    map.insert("port".to_string(), json!(config.port));
    map.insert("database".to_string(), json!(config.database));
    map.insert("username".to_string(), json!(config.username));
    map.insert("password".to_string(), json!(config.password));
    map
}

/// Create or reuse the cached source Postgres engine.
pub async fn get_postgres_engine(
    config: Option<&JsonMap>,
    reuse: bool,
) -> Result<DbEngine, EtlError> {
    let resolved = resolve(config, "PG")?;
    let url = build_postgres_url(&resolved)?;
    let timeout = resolved.connect_timeout_seconds;
    get_or_create_engine(
        "src_postgres",
        &identity(&resolved),
        || async move { DbEngine::connect(&url, timeout).await },
        reuse,
    )
    .await
}

/// Run `SELECT 1` against the configured database.
pub async fn test_postgres_connection(config: Option<&JsonMap>) -> bool {
    match get_postgres_engine(config, true).await {
        Ok(engine) => engine.health_check().await.is_ok(),
        Err(_) => false,
    }
}

pub struct PostgresConnector {
    conn: SqlConnection,
}

impl PostgresConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let config = resolve(Some(payload), "PG")?;
        Ok(Self {
            conn: SqlConnection::new(
                "postgres",
                "src_postgres",
                build_postgres_url(&config)?,
                identity(&config),
                config.connect_timeout_seconds,
                config.reuse,
            ),
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(PostgresConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for PostgresConnector {
    fn protocol(&self) -> &'static str {
        "postgres"
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

    fn config(password: &str) -> PostgresConfig {
        PostgresConfig {
            host: "db.internal".to_string(),
            port: 5433,
            database: "warehouse".to_string(),
            username: "loader".to_string(),
            password: password.to_string(),
            connect_timeout_seconds: 30,
            reuse: true,
        }
    }

    #[test]
    fn url_includes_all_parts() {
        let url = build_postgres_url(&config("pw")).unwrap();
        assert_eq!(url, "postgres://loader:pw@db.internal:5433/warehouse");
    }

    #[test]
    fn credentials_are_percent_encoded() {
        let url = build_postgres_url(&config("p@ss/word")).unwrap();
        assert!(url.contains("p%40ss%2Fword"));
        assert!(!url.contains("p@ss/word"));
    }

    #[test]
    fn missing_required_keys_are_reported() {
        let mut payload = JsonMap::new();
        payload.insert("host".to_string(), json!("h"));
        let err = resolve(Some(&payload), "GRANARY_PG_UNSET").unwrap_err();
        assert!(err.to_string().contains("database"));
        assert!(err.to_string().contains("username"));
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn env_string_port_is_coerced() {
        let mut payload = JsonMap::new();
        payload.insert("host".to_string(), json!("h"));
        payload.insert("port".to_string(), json!("6543"));
        payload.insert("database".to_string(), json!("d"));
        payload.insert("username".to_string(), json!("u"));
        payload.insert("password".to_string(), json!("p"));
        let resolved = resolve(Some(&payload), "GRANARY_PG_UNSET").unwrap();
        assert_eq!(resolved.port, 6543);
    }
}
