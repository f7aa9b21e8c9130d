//! HTTP source connector.
//!
//! Holds one cached client per thread with the configured base URL, bearer
//! token, and timeout. Non-2xx responses become failure envelopes carrying
//! `"<status> <body-snippet>"`; transport errors surface as fetch errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::session::get_or_create_session;
use granary_core::{EtlError, IngestedItem, IngestionResult, JsonMap, Payload};

use crate::connector::Connector;

const BODY_SNIPPET_LIMIT: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout", deserialize_with = "de::lenient_u64")]
    pub timeout_seconds: u64,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_reuse", deserialize_with = "de::lenient_bool")]
    pub reuse: bool,
}

fn default_timeout() -> u64 {
    30
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_reuse() -> bool {
    true
}

pub struct HttpConnector {
    config: HttpConfig,
    identity: JsonMap,
    client: Option<Arc<reqwest::Client>>,
}

impl HttpConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("REST".to_string()),
            ..Default::default()
        };
        let merged = load_connection_config(Some(payload), &layers, &["base_url"])?;
        let config: HttpConfig = typed_config("http", &merged)?;

        let mut identity = JsonMap::new();
        identity.insert("base_url".to_string(), json!(config.base_url));
        identity.insert("token".to_string(), json!(config.token));
        identity.insert("timeout_seconds".to_string(), json!(config.timeout_seconds));

        Ok(Self {
            config,
            identity,
            client: None,
        })
    }

    fn build_client(config: &HttpConfig) -> Result<reqwest::Client, EtlError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| EtlError::InvalidConfig("token contains invalid characters".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))
    }

    fn join_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(HttpConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for HttpConnector {
    fn protocol(&self) -> &'static str {
        "http"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        info!(
            config = %granary_core::redact::redacted_display(&self.identity),
            "connecting http connector"
        );
        let config = self.config.clone();
        let client = get_or_create_session(
            "http",
            &self.identity,
            || async move { Self::build_client(&config) },
            self.config.reuse,
        )
        .await?;
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let client = self.client.as_ref().ok_or(EtlError::NotConnected("http"))?;
        if query.trim().is_empty() {
            return Err(EtlError::EmptyQuery("http"));
        }

        let url = self.join_url(query.trim());
        let method = reqwest::Method::from_bytes(self.config.method.to_uppercase().as_bytes())
            .map_err(|_| {
                EtlError::InvalidConfig(format!("invalid HTTP method '{}'", self.config.method))
            })?;
        debug!(%url, method = %method, "dispatching http request");

        let response = client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;

        if !status.is_success() {
            let snippet: String = body.chars().take(BODY_SNIPPET_LIMIT).collect();
            return Ok(IngestionResult::failure(
                "http",
                format!("{} {}", status.as_u16(), snippet),
            )
            .with_metadata("status_code", json!(status.as_u16())));
        }

        Ok(
            IngestionResult::success("http", vec![IngestedItem::with_payload(body_payload(&body))])
                .with_metadata("status_code", json!(status.as_u16())),
        )
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        // Cached clients stay in the session cache until close_all_sessions.
        self.client = None;
        Ok(())
    }
}

/// Map a response body into one payload: a JSON array becomes a row batch
/// (one row per element), a JSON object one row, anything else a scalar.
fn body_payload(body: &str) -> Payload {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => Payload::from_value(value),
        Err(_) => Payload::Scalar(Value::String(body.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(base_url: &str) -> HttpConnector {
        let mut payload = JsonMap::new();
        payload.insert("base_url".to_string(), json!(base_url));
        HttpConnector::from_config(&payload).unwrap()
    }

    #[test]
    fn join_url_handles_slashes() {
        let c = connector("http://api.internal/");
        assert_eq!(c.join_url("/users"), "http://api.internal/users");
        assert_eq!(c.join_url("users"), "http://api.internal/users");
    }

    #[test]
    fn json_array_maps_to_one_row_per_element() {
        match body_payload(r#"[{"id":1},{"id":2},{"id":3}]"#) {
            Payload::Rows(rows) => assert_eq!(rows.len(), 3),
            other => panic!("expected row batch, got {:?}", other),
        }
    }

    #[test]
    fn json_object_maps_to_one_row() {
        match body_payload(r#"{"id":1}"#) {
            Payload::Row(row) => assert_eq!(row["id"], json!(1)),
            other => panic!("expected row payload, got {:?}", other),
        }
    }

    #[test]
    fn non_json_body_becomes_a_scalar() {
        match body_payload("plain text") {
            Payload::Scalar(Value::String(s)) => assert_eq!(s, "plain text"),
            other => panic!("expected scalar payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_before_connect_fails() {
        let mut c = connector("http://api.internal");
        let err = c.fetch("/users").await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test]
    async fn empty_query_fails() {
        let mut c = connector("http://api.internal");
        c.connect().await.unwrap();
        let err = c.fetch("").await.unwrap_err();
        assert!(err.to_string().contains("empty query"));
    }
}
