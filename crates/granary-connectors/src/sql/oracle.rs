//! Oracle source connector.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{EtlError, IngestionResult, JsonMap};

use super::SqlConnection;
use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "de::lenient_u16")]
    pub port: u16,
    pub service_name: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout", deserialize_with = "de::lenient_u64")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_reuse", deserialize_with = "de::lenient_bool")]
    pub reuse: bool,
}

fn default_port() -> u16 {
    1521
}

fn default_timeout() -> u64 {
    30
}

fn default_reuse() -> bool {
    true
}

pub fn build_oracle_url(config: &OracleConfig) -> Result<String, EtlError> {
    let mut url =
        Url::parse("oracle://localhost").map_err(|e| EtlError::InvalidConfig(e.to_string()))?;
    url.set_host(Some(&config.host))
        .map_err(|_| EtlError::InvalidConfig(format!("invalid host '{}'", config.host)))?;
    url.set_port(Some(config.port))
        .map_err(|_| EtlError::InvalidConfig(format!("invalid port {}", config.port)))?;
    url.set_path(&config.service_name);
    url.set_username(&config.username)
        .map_err(|_| EtlError::InvalidConfig("invalid username".to_string()))?;
    url.set_password(Some(&config.password))
        .map_err(|_| EtlError::InvalidConfig("invalid password".to_string()))?;
    Ok(url.to_string())
}

fn resolve(config: Option<&JsonMap>) -> Result<OracleConfig, EtlError> {
    let layers = ConfigLayers {
        env_prefix: Some("ORACLE".to_string()),
        ..Default::default()
    };
    let merged = load_connection_config(
        config,
        &layers,
        &["host", "service_name", "username", "password"],
    )?;
    typed_config("oracle", &merged)
}

fn identity(config: &OracleConfig) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("host".to_string(), json!(config.host));
    map.insert("port".to_string(), json!(config.port));
    map.insert("service_name".to_string(), json!(config.service_name));
    map.insert("username".to_string(), json!(config.username));
    map.insert("password".to_string(), json!(config.password));
    map
}

pub struct OracleConnector {
    conn: SqlConnection,
}

impl OracleConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let config = resolve(Some(payload))?;
        Ok(Self {
            conn: SqlConnection::new(
                "oracle",
                "src_oracle",
                build_oracle_url(&config)?,
                identity(&config),
                config.connect_timeout_seconds,
                config.reuse,
            ),
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(OracleConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for OracleConnector {
    fn protocol(&self) -> &'static str {
        "oracle"
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
    fn url_uses_service_name_as_path() {
        let config = OracleConfig {
            host: "ora.internal".to_string(),
            port: default_port(),
            service_name: "ORCLPDB1".to_string(),
            username: "reader".to_string(),
            password: "pw".to_string(),
            connect_timeout_seconds: 30,
            reuse: true,
        };
        assert_eq!(
            build_oracle_url(&config).unwrap(),
            "oracle://reader:pw@ora.internal:1521/ORCLPDB1"
        );
    }

    #[test]
    fn service_name_is_required() {
        let mut payload = JsonMap::new();
        payload.insert("host".to_string(), json!("h"));
        payload.insert("username".to_string(), json!("u"));
        payload.insert("password".to_string(), json!("p"));
        let err = resolve(Some(&payload)).unwrap_err();
        assert!(err.to_string().contains("service_name"));
    }
}
