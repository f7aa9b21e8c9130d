//! NATS JetStream micro-batch consumer.
//!
//! Uses a durable pull consumer on a JetStream stream covering the
//! configured subject; messages are acknowledged individually after the
//! staged file has been renamed into place.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use async_nats::jetstream::{self, consumer::PullConsumer};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info};

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{lake, EtlError, IngestionResult, JsonMap};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(deserialize_with = "de::string_or_seq")]
    pub servers: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub durable_name: Option<String>,
    #[serde(default = "default_lake_path")]
    pub lake_path: String,
    #[serde(default = "default_max_messages", deserialize_with = "de::lenient_usize")]
    pub max_messages: usize,
    #[serde(default = "default_max_wait", deserialize_with = "de::lenient_f64")]
    pub max_wait_seconds: f64,
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

impl NatsConfig {
    /// Stream name: explicit config, or the subject uppercased with
    /// separators flattened.
    fn stream_name(&self) -> String {
        self.stream
            .clone()
            .unwrap_or_else(|| lake::safe_name(&self.subject).to_uppercase())
    }

    fn durable(&self) -> String {
        self.durable_name
            .clone()
            .unwrap_or_else(|| format!("granary-{}", lake::safe_name(&self.subject)))
    }
}

pub struct NatsConnector {
    config: NatsConfig,
    consumer: Option<PullConsumer>,
}

impl NatsConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("NATS".to_string()),
            ..Default::default()
        };
        let merged = load_connection_config(Some(payload), &layers, &["servers", "subject"])?;
        let config: NatsConfig = typed_config("nats", &merged)?;
        if config.servers.is_empty() {
            return Err(EtlError::InvalidConfig(
                "nats requires at least one server".to_string(),
            ));
        }
        Ok(Self {
            config,
            consumer: None,
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(NatsConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for NatsConnector {
    fn protocol(&self) -> &'static str {
        "nats"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        let servers = self.config.servers.join(",");
        info!(servers = %servers, subject = %self.config.subject, "connecting nats connector");

        let client = async_nats::connect(&servers)
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        let jetstream = jetstream::new(client);

        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: self.config.stream_name(),
                subjects: vec![self.config.subject.clone()],
                ..Default::default()
            })
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;

        let durable = self.config.durable();
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;

        self.consumer = Some(consumer);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or(EtlError::NotConnected("nats"))?;
        let stream_name = if query.trim().is_empty() {
            self.config.subject.clone()
        } else {
            query.trim().to_string()
        };

        let mut batch = consumer
            .fetch()
            .max_messages(self.config.max_messages)
            .expires(Duration::from_secs_f64(self.config.max_wait_seconds))
            .messages()
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;

        let mut messages = Vec::new();
        let mut records: Vec<JsonMap> = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| EtlError::FetchFailed(e.to_string()))?;
            records.push(super::message_record(
                message.subject.as_str(),
                None,
                Some(message.payload.as_ref()),
                None,
                Utc::now(),
            ));
            messages.push(message);
        }

        debug!(messages = records.len(), subject = %stream_name, "nats micro-batch consumed");
        let result = super::stage_micro_batch(
            "nats",
            &stream_name,
            &records,
            &PathBuf::from(&self.config.lake_path),
        )?;

        // Ack only after the staged file is in place.
        for message in messages {
            message
                .ack()
                .await
                .map_err(|e| EtlError::FetchFailed(format!("ack failed: {}", e)))?;
        }

        Ok(result)
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        self.consumer = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("servers".to_string(), json!("nats://mq.internal:4222"));
        map.insert("subject".to_string(), json!("orders.created"));
        map
    }

    #[test]
    fn stream_name_derives_from_subject() {
        let connector = NatsConnector::from_config(&payload()).unwrap();
        assert_eq!(connector.config.stream_name(), "ORDERS_CREATED");
        assert_eq!(connector.config.durable(), "granary-orders_created");
    }

    #[test]
    fn explicit_stream_name_wins() {
        let mut map = payload();
        map.insert("stream".to_string(), json!("ORDERS"));
        let connector = NatsConnector::from_config(&map).unwrap();
        assert_eq!(connector.config.stream_name(), "ORDERS");
    }

    #[tokio::test]
    async fn fetch_before_connect_fails() {
        let mut connector = NatsConnector::from_config(&payload()).unwrap();
        let err = connector.fetch("").await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }
}
