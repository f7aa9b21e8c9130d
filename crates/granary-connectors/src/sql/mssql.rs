//! Microsoft SQL Server source connector.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{EtlError, IngestionResult, JsonMap};

use super::SqlConnection;
use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct MssqlConfig {
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
    1433
}

fn default_timeout() -> u64 {
    30
}

fn default_reuse() -> bool {
    true
}

pub fn build_mssql_url(config: &MssqlConfig) -> Result<String, EtlError> {
    let mut url =
        Url::parse("mssql://localhost").map_err(|e| EtlError::InvalidConfig(e.to_string()))?;
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

fn resolve(config: Option<&JsonMap>) -> Result<MssqlConfig, EtlError> {
    let layers = ConfigLayers {
        env_prefix: Some("MSSQL".to_string()),
        ..Default::default()
    };
    let merged = load_connection_config(
        config,
        &layers,
        &["host", "database", "username", "password"],
    )?;
    typed_config("mssql", &merged)
}

fn identity(config: &MssqlConfig) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("host".to_string(), json!(config.host));
    map.insert("port".to_string(), json!(config.port));
    map.insert("database".to_string(), json!(config.database));
    map.insert("username".to_string(), json!(config.username));
    map.insert("password".to_string(), json!(config.password));
    map
}

pub struct MssqlConnector {
    conn: SqlConnection,
}

impl MssqlConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let config = resolve(Some(payload))?;
        Ok(Self {
            conn: SqlConnection::new(
                "mssql",
                "src_mssql",
                build_mssql_url(&config)?,
                identity(&config),
                config.connect_timeout_seconds,
                config.reuse,
            ),
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(MssqlConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for MssqlConnector {
    fn protocol(&self) -> &'static str {
        "mssql"
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
