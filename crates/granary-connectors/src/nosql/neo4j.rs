//! Neo4j source connector.

use std::sync::Arc;

use async_trait::async_trait;
use neo4rs::Graph;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::session::get_or_create_session;
use granary_core::{EtlError, IngestedItem, IngestionResult, JsonMap, Payload};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_reuse", deserialize_with = "de::lenient_bool")]
    pub reuse: bool,
}

fn default_database() -> String {
    "neo4j".to_string()
}

fn default_reuse() -> bool {
    true
}

pub struct Neo4jConnector {
    config: Neo4jConfig,
    identity: JsonMap,
    graph: Option<Arc<Graph>>,
}

impl std::fmt::Debug for Neo4jConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neo4jConnector")
            .field("config", &self.config)
            .field("identity", &self.identity)
            .field("graph", &self.graph.is_some())
            .finish()
    }
}

impl Neo4jConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("NEO4J".to_string()),
            ..Default::default()
        };
        let merged =
            load_connection_config(Some(payload), &layers, &["uri", "username", "password"])?;
        let config: Neo4jConfig = typed_config("neo4j", &merged)?;

        let mut identity = JsonMap::new();
        identity.insert("uri".to_string(), json!(config.uri));
        identity.insert("username".to_string(), json!(config.username));
        identity.insert("database".to_string(), json!(config.database));

        Ok(Self {
            config,
            identity,
            graph: None,
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(Neo4jConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for Neo4jConnector {
    fn protocol(&self) -> &'static str {
        "neo4j"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        info!(uri = %self.config.uri, "connecting neo4j connector");
        let config = self.config.clone();
        let graph = get_or_create_session(
            "neo4j",
            &self.identity,
            || async move {
                Graph::new(&config.uri, &config.username, &config.password)
                    .await
                    .map_err(|e| EtlError::ConnectionFailed(e.to_string()))
            },
            self.config.reuse,
        )
        .await?;
        self.graph = Some(graph);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let graph = self.graph.as_ref().ok_or(EtlError::NotConnected("neo4j"))?;
        let cypher = query.trim();
        if cypher.is_empty() {
            return Err(EtlError::EmptyQuery("neo4j"));
        }

        debug!(%cypher, "executing cypher query");
        let mut stream = graph
            .execute(neo4rs::query(cypher))
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;

        let mut rows: Vec<JsonMap> = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?
        {
            let value: Value = row
                .to::<Value>()
                .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
            match value {
                Value::Object(map) => rows.push(map),
                other => {
                    let mut map = JsonMap::new();
                    map.insert("payload".to_string(), other);
                    rows.push(map);
                }
            }
        }

        let count = rows.len();
        Ok(IngestionResult::success(
            "neo4j",
            vec![IngestedItem::with_payload(Payload::Rows(rows))],
        )
        .with_metadata("rows", json!(count)))
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        self.graph = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_defaults_to_neo4j() {
        let mut payload = JsonMap::new();
        payload.insert("uri".to_string(), json!("bolt://graph.internal:7687"));
        payload.insert("username".to_string(), json!("reader"));
        payload.insert("password".to_string(), json!("pw"));
        let connector = Neo4jConnector::from_config(&payload).unwrap();
        assert_eq!(connector.config.database, "neo4j");
    }

    #[test]
    fn credentials_are_required() {
        let mut payload = JsonMap::new();
        payload.insert("uri".to_string(), json!("bolt://graph.internal:7687"));
        let err = Neo4jConnector::from_config(&payload).unwrap_err();
        assert!(err.to_string().contains("username"));
        assert!(err.to_string().contains("password"));
    }
}
