//! MongoDB source connector.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::session::get_or_create_session;
use granary_core::{EtlError, IngestedItem, IngestionResult, JsonMap, Payload};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "de::lenient_u16")]
    pub port: u16,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth_source: Option<String>,
    #[serde(default = "default_reuse", deserialize_with = "de::lenient_bool")]
    pub reuse: bool,
}

fn default_port() -> u16 {
    27017
}

fn default_reuse() -> bool {
    true
}

pub fn build_mongo_uri(config: &MongoConfig) -> Result<String, EtlError> {
    let mut url = Url::parse("mongodb://localhost")
        .map_err(|e| EtlError::InvalidConfig(e.to_string()))?;
    url.set_host(Some(&config.host))
        .map_err(|_| EtlError::InvalidConfig(format!("invalid host '{}'", config.host)))?;
    url.set_port(Some(config.port))
        .map_err(|_| EtlError::InvalidConfig(format!("invalid port {}", config.port)))?;
    if let Some(username) = &config.username {
        url.set_username(username)
            .map_err(|_| EtlError::InvalidConfig("invalid username".to_string()))?;
        url.set_password(config.password.as_deref())
            .map_err(|_| EtlError::InvalidConfig("invalid password".to_string()))?;
    }
    if let Some(auth_source) = &config.auth_source {
        url.set_query(Some(&format!("authSource={}", auth_source)));
    }
    Ok(url.to_string())
}

pub struct MongoConnector {
    config: MongoConfig,
    identity: JsonMap,
    client: Option<Arc<Client>>,
}

impl MongoConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("MONGODB".to_string()),
            ..Default::default()
        };
        let merged = load_connection_config(Some(payload), &layers, &["host", "database"])?;
        let config: MongoConfig = typed_config("mongodb", &merged)?;

        let mut identity = JsonMap::new();
        identity.insert("host".to_string(), json!(config.host));
        identity.insert("port".to_string(), json!(config.port));
        identity.insert("database".to_string(), json!(config.database));
        identity.insert("username".to_string(), json!(config.username));

        Ok(Self {
            config,
            identity,
            client: None,
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(MongoConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for MongoConnector {
    fn protocol(&self) -> &'static str {
        "mongodb"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        info!(host = %self.config.host, database = %self.config.database, "connecting mongodb connector");
        let uri = build_mongo_uri(&self.config)?;
        let client = get_or_create_session(
            "mongodb",
            &self.identity,
            || async move {
                Client::with_uri_str(&uri)
                    .await
                    .map_err(|e| EtlError::ConnectionFailed(e.to_string()))
            },
            self.config.reuse,
        )
        .await?;
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let client = self
            .client
            .as_ref()
            .ok_or(EtlError::NotConnected("mongodb"))?;
        let collection_name = query.trim();
        if collection_name.is_empty() {
            return Err(EtlError::EmptyQuery("mongodb"));
        }

        debug!(collection = collection_name, "fetching mongodb collection");
        let collection = client
            .database(&self.config.database)
            .collection::<Document>(collection_name);
        let documents: Vec<Document> = collection
            .find(doc! {})
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;

        let count = documents.len();
        let items = documents
            .into_iter()
            .map(|document| {
                IngestedItem::with_payload(Payload::Row(document_to_row(&document)))
            })
            .collect();

        Ok(IngestionResult::success("mongodb", items)
            .with_metadata("collection", json!(collection_name))
            .with_metadata("fetched_documents", json!(count)))
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        self.client = None;
        Ok(())
    }
}

fn document_to_row(document: &Document) -> JsonMap {
    document
        .iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

/// Convert a BSON value into plain JSON, stringifying driver-native types
/// that would not survive a columnar round trip.
fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Document(doc) => Value::Object(document_to_row(doc)),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Binary(b) => Value::String(
            b.bytes
                .iter()
                .map(|byte| format!("{:02x}", byte))
                .collect::<String>(),
        ),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Null => Value::Null,
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;

    #[test]
    fn uri_carries_credentials_and_auth_source() {
        let config = MongoConfig {
            host: "mongo.internal".to_string(),
            port: 27017,
            database: "app".to_string(),
            username: Some("reader".to_string()),
            password: Some("pw".to_string()),
            auth_source: Some("admin".to_string()),
            reuse: true,
        };
        assert_eq!(
            build_mongo_uri(&config).unwrap(),
            "mongodb://reader:pw@mongo.internal:27017?authSource=admin"
        );
    }

    #[test]
    fn uri_without_credentials() {
        let config = MongoConfig {
            host: "mongo.internal".to_string(),
            port: 27018,
            database: "app".to_string(),
            username: None,
            password: None,
            auth_source: None,
            reuse: true,
        };
        assert_eq!(
            build_mongo_uri(&config).unwrap(),
            "mongodb://mongo.internal:27018"
        );
    }

    #[test]
    fn object_ids_are_stringified() {
        let oid = ObjectId::new();
        let mut document = Document::new();
        document.insert("_id", Bson::ObjectId(oid));
        document.insert("n", Bson::Int64(7));

        let row = document_to_row(&document);
        assert_eq!(row["_id"], Value::String(oid.to_hex()));
        assert_eq!(row["n"], json!(7));
    }

    #[test]
    fn nested_documents_recurse() {
        let mut inner = Document::new();
        inner.insert("flag", Bson::Boolean(true));
        let mut document = Document::new();
        document.insert("meta", Bson::Document(inner));

        let row = document_to_row(&document);
        assert_eq!(row["meta"]["flag"], Value::Bool(true));
    }
}
