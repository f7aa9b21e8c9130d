//! Kafka micro-batch consumer.
//!
//! Offsets are committed synchronously after the staged file has been
//! renamed into its partition, never before.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::ClientConfig;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{EtlError, IngestionResult, JsonMap};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_lake_path")]
    pub lake_path: String,
    #[serde(default = "default_max_messages", deserialize_with = "de::lenient_usize")]
    pub max_messages: usize,
    #[serde(default = "default_max_wait", deserialize_with = "de::lenient_f64")]
    pub max_wait_seconds: f64,
    #[serde(default = "default_poll_timeout", deserialize_with = "de::lenient_f64")]
    pub poll_timeout_seconds: f64,
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

fn default_offset_reset() -> String {
    "earliest".to_string()
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

pub struct KafkaConnector {
    config: KafkaConfig,
    consumer: Option<StreamConsumer>,
}

impl std::fmt::Debug for KafkaConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConnector")
            .field("config", &self.config)
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}

impl KafkaConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("KAFKA".to_string()),
            ..Default::default()
        };
        let merged = load_connection_config(
            Some(payload),
            &layers,
            &["bootstrap_servers", "topic", "group_id"],
        )?;
        let config: KafkaConfig = typed_config("kafka", &merged)?;
        Ok(Self {
            config,
            consumer: None,
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(KafkaConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for KafkaConnector {
    fn protocol(&self) -> &'static str {
        "kafka"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        info!(
            bootstrap_servers = %self.config.bootstrap_servers,
            topic = %self.config.topic,
            "connecting kafka connector"
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", &self.config.group_id)
            .set("security.protocol", &self.config.security_protocol)
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;

        self.consumer = Some(consumer);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or(EtlError::NotConnected("kafka"))?;

        let stream_name = if query.trim().is_empty() {
            self.config.topic.clone()
        } else {
            query.trim().to_string()
        };
        if stream_name != self.config.topic {
            consumer
                .subscribe(&[stream_name.as_str()])
                .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
        }

        let deadline = Instant::now() + Duration::from_secs_f64(self.config.max_wait_seconds);
        let poll_timeout = Duration::from_secs_f64(self.config.poll_timeout_seconds);
        let mut records: Vec<JsonMap> = Vec::new();

        while records.len() < self.config.max_messages && Instant::now() < deadline {
            match tokio::time::timeout(poll_timeout, consumer.recv()).await {
                Err(_) => continue,
                Ok(Err(e)) => return Err(EtlError::FetchFailed(e.to_string())),
                Ok(Ok(message)) => {
                    let key = message
                        .key()
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
                    let headers = message.headers().map(|headers| {
                        let mut map = Map::new();
                        for header in headers.iter() {
                            map.insert(
                                header.key.to_string(),
                                header
                                    .value
                                    .map(|v| json!(String::from_utf8_lossy(v).into_owned()))
                                    .unwrap_or(Value::Null),
                            );
                        }
                        Value::Object(map)
                    });
                    let ts = message
                        .timestamp()
                        .to_millis()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                        .unwrap_or_else(Utc::now);

                    records.push(super::message_record(
                        message.topic(),
                        key,
                        message.payload(),
                        headers,
                        ts,
                    ));
                }
            }
        }

        debug!(messages = records.len(), stream = %stream_name, "kafka micro-batch consumed");
        let result = super::stage_micro_batch(
            "kafka",
            &stream_name,
            &records,
            &PathBuf::from(&self.config.lake_path),
        )?;

        // Commit only after the batch file is durably in place.
        if !records.is_empty() {
            consumer
                .commit_consumer_state(CommitMode::Sync)
                .map_err(|e| EtlError::FetchFailed(format!("offset commit failed: {}", e)))?;
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

    #[test]
    fn defaults_are_applied() {
        let mut payload = JsonMap::new();
        payload.insert("bootstrap_servers".to_string(), json!("broker:9092"));
        payload.insert("topic".to_string(), json!("events"));
        payload.insert("group_id".to_string(), json!("granary"));
        let connector = KafkaConnector::from_config(&payload).unwrap();
        assert_eq!(connector.config.security_protocol, "PLAINTEXT");
        assert_eq!(connector.config.auto_offset_reset, "earliest");
        assert_eq!(connector.config.max_messages, 500);
        assert!((connector.config.max_wait_seconds - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn group_id_is_required() {
        let mut payload = JsonMap::new();
        payload.insert("bootstrap_servers".to_string(), json!("broker:9092"));
        payload.insert("topic".to_string(), json!("events"));
        let err = KafkaConnector::from_config(&payload).unwrap_err();
        assert!(err.to_string().contains("group_id"));
    }

    #[tokio::test]
    async fn fetch_before_connect_fails() {
        let mut payload = JsonMap::new();
        payload.insert("bootstrap_servers".to_string(), json!("broker:9092"));
        payload.insert("topic".to_string(), json!("events"));
        payload.insert("group_id".to_string(), json!("granary"));
        let mut connector = KafkaConnector::from_config(&payload).unwrap();
        let err = connector.fetch("events").await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }
}
