//! Connector registry - pluggable source discovery by protocol tag.
//!
//! Each connector module contributes a `(protocol, factory)` pair; creating
//! a connector is a table lookup on the config's `protocol` field. Adding a
//! new connector means adding a module and one registration line here.

use std::collections::HashMap;

use serde_json::Value;
use tracing::info;

use granary_core::{redact_config, EtlError, JsonMap};

use crate::connector::Connector;

/// Builds a connector from its resolved (protocol-stripped) config.
pub type ConnectorFactory = fn(&JsonMap) -> Result<Box<dyn Connector>, EtlError>;

/// Registry of connector factories keyed by protocol.
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// An empty registry. Useful for tests that register mock connectors.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in protocol registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("postgres", crate::sql::postgres::factory);
        registry.register("mssql", crate::sql::mssql::factory);
        registry.register("oracle", crate::sql::oracle::factory);
        registry.register("sqlite", crate::sql::sqlite::factory);
        registry.register("http", crate::http::factory);
        registry.register("soap", crate::soap::factory);
        registry.register("ftp", crate::files::ftp::factory);
        registry.register("sftp", crate::files::sftp::factory);
        registry.register("webdav", crate::files::webdav::factory);
        registry.register("mongodb", crate::nosql::mongodb::factory);
        registry.register("cassandra", crate::nosql::cassandra::factory);
        registry.register("neo4j", crate::nosql::neo4j::factory);
        registry.register("kafka", crate::streams::kafka::factory);
        registry.register("amqp", crate::streams::amqp::factory);
        registry.register("nats", crate::streams::nats::factory);
        registry
    }

    /// Register (or replace) the factory for a protocol.
    pub fn register(&mut self, protocol: &str, factory: ConnectorFactory) {
        self.factories.insert(protocol.to_lowercase(), factory);
    }

    /// Instantiate the connector selected by the config's `protocol` field.
    pub fn create(&self, config: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
        let protocol = normalize_protocol(config.get("protocol"))?;

        let mut payload = config.clone();
        payload.remove("protocol");

        let factory = self
            .factories
            .get(&protocol)
            .ok_or_else(|| EtlError::UnknownProtocol(protocol.clone()))?;

        info!(
            protocol = %protocol,
            config = %serde_json::to_string(&redact_config(&payload)).unwrap_or_default(),
            "creating connector"
        );
        factory(&payload)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn normalize_protocol(value: Option<&Value>) -> Result<String, EtlError> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_lowercase()),
        _ => Err(EtlError::InvalidConfig(
            "missing required 'protocol' field in connector configuration".to_string(),
        )),
    }
}
