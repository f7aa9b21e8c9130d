//! AMQP (RabbitMQ) micro-batch consumer.
//!
//! Pulls with `basic_get` so consumption stays bounded, and acknowledges
//! the whole batch (multiple-ack on the last delivery tag) only after the
//! staged file has been renamed into place.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{BasicAckOptions, BasicGetOptions};
use lapin::{Channel, Connection, ConnectionProperties};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{EtlError, IngestionResult, JsonMap};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct AmqpConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "de::lenient_u16")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    pub queue: String,
    #[serde(default = "default_lake_path")]
    pub lake_path: String,
    #[serde(default = "default_max_messages", deserialize_with = "de::lenient_usize")]
    pub max_messages: usize,
    #[serde(default = "default_max_wait", deserialize_with = "de::lenient_f64")]
    pub max_wait_seconds: f64,
    #[serde(default = "default_poll_timeout", deserialize_with = "de::lenient_f64")]
    pub poll_timeout_seconds: f64,
}

fn default_port() -> u16 {
    5672
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_lake_path() -> String {
    "./lake".to_string()
}

fn default_max_messages() -> usize {
    500
}

fn default_max_wait() -> f64 {
    5.0
}

fn default_poll_timeout() -> f64 {
    1.0
}

pub fn build_amqp_uri(config: &AmqpConfig) -> Result<String, EtlError> {
    let mut url =
        Url::parse("amqp://localhost").map_err(|e| EtlError::InvalidConfig(e.to_string()))?;
    url.set_host(Some(&config.host))
        .map_err(|_| EtlError::InvalidConfig(format!("invalid host '{}'", config.host)))?;
    url.set_port(Some(config.port))
        .map_err(|_| EtlError::InvalidConfig(format!("invalid port {}", config.port)))?;
    url.set_username(&config.username)
        .map_err(|_| EtlError::InvalidConfig("invalid username".to_string()))?;
    url.set_password(Some(&config.password))
        .map_err(|_| EtlError::InvalidConfig("invalid password".to_string()))?;
    // The default vhost "/" must be percent-encoded in the URI path.
    if config.virtual_host == "/" {
        url.set_path("/%2f");
    } else {
        url.set_path(&format!("/{}", config.virtual_host));
    }
    Ok(url.to_string())
}

pub struct AmqpConnector {
    config: AmqpConfig,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl AmqpConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("AMQP".to_string()),
            ..Default::default()
        };
        let merged = load_connection_config(
            Some(payload),
            &layers,
            &["host", "username", "password", "queue"],
        )?;
        let config: AmqpConfig = typed_config("amqp", &merged)?;
        Ok(Self {
            config,
            connection: None,
            channel: None,
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(AmqpConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for AmqpConnector {
    fn protocol(&self) -> &'static str {
        "amqp"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        info!(host = %self.config.host, queue = %self.config.queue, "connecting amqp connector");
        let uri = build_amqp_uri(&self.config)?;
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let channel = self.channel.as_ref().ok_or(EtlError::NotConnected("amqp"))?;
        let queue = if query.trim().is_empty() {
            self.config.queue.clone()
        } else {
            query.trim().to_string()
        };

        let deadline = Instant::now() + Duration::from_secs_f64(self.config.max_wait_seconds);
        let poll_timeout = Duration::from_secs_f64(self.config.poll_timeout_seconds);
        let mut records: Vec<JsonMap> = Vec::new();
        let mut last_delivery_tag: Option<u64> = None;

        while records.len() < self.config.max_messages && Instant::now() < deadline {
            let delivery = channel
                .basic_get(&queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| EtlError::FetchFailed(e.to_string()))?;

            match delivery {
                None => tokio::time::sleep(poll_timeout).await,
                Some(message) => {
                    let delivery = message.delivery;
                    last_delivery_tag = Some(delivery.delivery_tag);
                    records.push(super::message_record(
                        &queue,
                        Some(delivery.routing_key.to_string()),
                        Some(&delivery.data),
                        None,
                        Utc::now(),
                    ));
                }
            }
        }

        debug!(messages = records.len(), queue = %queue, "amqp micro-batch consumed");
        let result = super::stage_micro_batch(
            "amqp",
            &queue,
            &records,
            &PathBuf::from(&self.config.lake_path),
        )?;

        // Ack the whole batch only after the staged file is in place.
        if let Some(tag) = last_delivery_tag {
            channel
                .basic_ack(
                    tag,
                    BasicAckOptions {
                        multiple: true,
                    },
                )
                .await
                .map_err(|e| EtlError::FetchFailed(format!("batch ack failed: {}", e)))?;
        }

        Ok(result)
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        self.channel = None;
        if let Some(connection) = self.connection.take() {
            let _ = connection.close(200, "closing").await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> AmqpConfig {
        AmqpConfig {
            host: "mq.internal".to_string(),
            port: 5672,
            username: "loader".to_string(),
            password: "pw".to_string(),
            virtual_host: "/".to_string(),
            queue: "ingest".to_string(),
            lake_path: "./lake".to_string(),
            max_messages: 500,
            max_wait_seconds: 5.0,
            poll_timeout_seconds: 1.0,
        }
    }

    #[test]
    fn default_vhost_is_percent_encoded() {
        assert_eq!(
            build_amqp_uri(&config()).unwrap(),
            "amqp://loader:pw@mq.internal:5672/%2f"
        );
    }

    #[test]
    fn named_vhost_is_kept() {
        let mut c = config();
        c.virtual_host = "staging".to_string();
        assert_eq!(
            build_amqp_uri(&c).unwrap(),
            "amqp://loader:pw@mq.internal:5672/staging"
        );
    }

    #[tokio::test]
    async fn fetch_before_connect_fails() {
        let mut payload = JsonMap::new();
        payload.insert("host".to_string(), json!("mq.internal"));
        payload.insert("username".to_string(), json!("u"));
        payload.insert("password".to_string(), json!("p"));
        payload.insert("queue".to_string(), json!("ingest"));
        let mut connector = AmqpConnector::from_config(&payload).unwrap();
        let err = connector.fetch("").await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }
}
