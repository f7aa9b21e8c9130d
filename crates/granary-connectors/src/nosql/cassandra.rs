//! Cassandra (CQL) source connector.

use std::sync::Arc;

use async_trait::async_trait;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::value::CqlValue;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::session::get_or_create_session;
use granary_core::{EtlError, IngestedItem, IngestionResult, JsonMap, Payload};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct CassandraConfig {
    #[serde(deserialize_with = "de::string_or_seq")]
    pub hosts: Vec<String>,
    #[serde(default = "default_port", deserialize_with = "de::lenient_u16")]
    pub port: u16,
    pub keyspace: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_reuse", deserialize_with = "de::lenient_bool")]
    pub reuse: bool,
}

fn default_port() -> u16 {
    9042
}

fn default_reuse() -> bool {
    true
}

pub struct CassandraConnector {
    config: CassandraConfig,
    identity: JsonMap,
    session: Option<Arc<Session>>,
}

impl CassandraConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("CASSANDRA".to_string()),
            ..Default::default()
        };
        let merged = load_connection_config(Some(payload), &layers, &["hosts", "keyspace"])?;
        let config: CassandraConfig = typed_config("cassandra", &merged)?;
        if config.hosts.is_empty() {
            return Err(EtlError::InvalidConfig(
                "cassandra requires at least one host".to_string(),
            ));
        }

        let mut identity = JsonMap::new();
        identity.insert("hosts".to_string(), json!(config.hosts.join(",")));
        identity.insert("port".to_string(), json!(config.port));
        identity.insert("keyspace".to_string(), json!(config.keyspace));
        identity.insert("username".to_string(), json!(config.username));

        Ok(Self {
            config,
            identity,
            session: None,
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(CassandraConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for CassandraConnector {
    fn protocol(&self) -> &'static str {
        "cassandra"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        info!(keyspace = %self.config.keyspace, "connecting cassandra connector");
        let config = self.config.clone();
        let session = get_or_create_session(
            "cassandra",
            &self.identity,
            || async move {
                let nodes: Vec<String> = config
                    .hosts
                    .iter()
                    .map(|host| format!("{}:{}", host, config.port))
                    .collect();
                let mut builder = SessionBuilder::new().known_nodes(&nodes);
                if let (Some(username), Some(password)) = (&config.username, &config.password) {
                    builder = builder.user(username, password);
                }
                let session = builder
                    .build()
                    .await
                    .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
                session
                    .use_keyspace(&config.keyspace, false)
                    .await
                    .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
                Ok(session)
            },
            self.config.reuse,
        )
        .await?;
        self.session = Some(session);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let session = self
            .session
            .as_ref()
            .ok_or(EtlError::NotConnected("cassandra"))?;
        let cql = query.trim();
        if cql.is_empty() {
            return Err(EtlError::EmptyQuery("cassandra"));
        }

        debug!(%cql, "executing cql query");
        let result = session
            .query_unpaged(cql, &[])
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
        let rows_result = result
            .into_rows_result()
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;

        let column_names: Vec<String> = rows_result
            .column_specs()
            .iter()
            .map(|spec| spec.name().to_string())
            .collect();

        let mut rows: Vec<JsonMap> = Vec::new();
        let typed_rows = rows_result
            .rows::<scylla::value::Row>()
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
        for row in typed_rows {
            let row = row.map_err(|e| EtlError::FetchFailed(e.to_string()))?;
            let mut map = JsonMap::new();
            for (name, value) in column_names.iter().zip(row.columns.iter()) {
                map.insert(
                    name.clone(),
                    value.as_ref().map(cql_to_json).unwrap_or(Value::Null),
                );
            }
            rows.push(map);
        }

        let count = rows.len();
        Ok(IngestionResult::success(
            "cassandra",
            vec![IngestedItem::with_payload(Payload::Rows(rows))],
        )
        .with_metadata("rows", json!(count)))
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        self.session = None;
        Ok(())
    }
}

/// Convert a CQL value into plain JSON, stringifying types that cannot
/// round-trip through a columnar file.
fn cql_to_json(value: &CqlValue) -> Value {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => Value::String(s.clone()),
        CqlValue::Boolean(b) => Value::Bool(*b),
        CqlValue::TinyInt(i) => Value::from(*i),
        CqlValue::SmallInt(i) => Value::from(*i),
        CqlValue::Int(i) => Value::from(*i),
        CqlValue::BigInt(i) => Value::from(*i),
        CqlValue::Counter(c) => Value::from(c.0),
        CqlValue::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CqlValue::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CqlValue::Uuid(u) => Value::String(u.to_string()),
        CqlValue::Timeuuid(u) => Value::String(u.to_string()),
        CqlValue::Inet(ip) => Value::String(ip.to_string()),
        CqlValue::Blob(bytes) => Value::String(
            bytes
                .iter()
                .map(|byte| format!("{:02x}", byte))
                .collect::<String>(),
        ),
        CqlValue::List(items) | CqlValue::Set(items) => {
            Value::Array(items.iter().map(cql_to_json).collect())
        }
        CqlValue::Map(pairs) => Value::Object(
            pairs
                .iter()
                .map(|(key, value)| (stringify_cql(key), cql_to_json(value)))
                .collect(),
        ),
        other => Value::String(format!("{:?}", other)),
    }
}

fn stringify_cql(value: &CqlValue) -> String {
    match cql_to_json(value) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
