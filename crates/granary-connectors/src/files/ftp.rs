//! FTP source connector.
//!
//! The FTP protocol library is blocking, so the control channel lives on
//! the blocking thread pool and moves in and out of the connector across
//! `spawn_blocking` calls.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::{debug, info};

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{EtlError, IngestionResult, JsonMap};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "de::lenient_u16")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_passive", deserialize_with = "de::lenient_bool")]
    pub passive_mode: bool,
    #[serde(default = "default_remote_base_path")]
    pub remote_base_path: String,
    #[serde(default = "default_lake_path")]
    pub lake_path: String,
    #[serde(default = "default_timeout", deserialize_with = "de::lenient_u64")]
    pub connect_timeout_seconds: u64,
}

fn default_port() -> u16 {
    21
}

fn default_username() -> String {
    "anonymous".to_string()
}

fn default_passive() -> bool {
    true
}

fn default_remote_base_path() -> String {
    "/".to_string()
}

fn default_lake_path() -> String {
    "./lake".to_string()
}

fn default_timeout() -> u64 {
    30
}

pub struct FtpConnector {
    config: FtpConfig,
    source_name: String,
    client: Option<FtpStream>,
}

impl FtpConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let mut defaults = JsonMap::new();
        defaults.insert("username".to_string(), json!(default_username()));
        let layers = ConfigLayers {
            env_prefix: Some("FTP".to_string()),
            defaults,
            ..Default::default()
        };
        let merged = load_connection_config(Some(payload), &layers, &["host", "username"])?;
        let config: FtpConfig = typed_config("ftp", &merged)?;
        let source_name = config.host.clone();
        Ok(Self {
            config,
            source_name,
            client: None,
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(FtpConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for FtpConnector {
    fn protocol(&self) -> &'static str {
        "ftp"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        let config = self.config.clone();
        info!(host = %config.host, port = config.port, "connecting ftp connector");

        let client = tokio::task::spawn_blocking(move || -> Result<FtpStream, EtlError> {
            use std::net::ToSocketAddrs;

            let addr = (config.host.as_str(), config.port)
                .to_socket_addrs()
                .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?
                .next()
                .ok_or_else(|| {
                    EtlError::ConnectionFailed(format!("cannot resolve host '{}'", config.host))
                })?;
            let mut stream = FtpStream::connect_timeout(
                addr,
                std::time::Duration::from_secs(config.connect_timeout_seconds),
            )
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
            stream
                .login(&config.username, &config.password)
                .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
            if config.passive_mode {
                stream.set_mode(Mode::Passive);
            }
            stream
                .transfer_type(FileType::Binary)
                .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
            Ok(stream)
        })
        .await
        .map_err(|e| EtlError::ConnectionFailed(e.to_string()))??;

        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let mut client = self.client.take().ok_or(EtlError::NotConnected("ftp"))?;
        let remote_path = super::resolve_remote_path(query, &self.config.remote_base_path).to_string();
        debug!(remote_path = %remote_path, "listing ftp directory");

        let listing_path = remote_path.clone();
        let (client, downloads) = tokio::task::spawn_blocking(
            move || -> (FtpStream, Result<Vec<(String, Vec<u8>)>, EtlError>) {
                let result = download_all(&mut client, &listing_path);
                (client, result)
            },
        )
        .await
        .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
        self.client = Some(client);
        let downloads = downloads?;

        let lake_root = PathBuf::from(&self.config.lake_path);
        let mut items = Vec::with_capacity(downloads.len());
        for (remote_file, bytes) in &downloads {
            items.push(super::stage_download(
                &lake_root,
                "ftp",
                &self.source_name,
                remote_file,
                bytes,
            )?);
        }

        let count = items.len();
        Ok(IngestionResult::success("ftp", items)
            .with_metadata("remote_path", json!(remote_path))
            .with_metadata("downloaded_files", json!(count)))
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        if let Some(mut client) = self.client.take() {
            tokio::task::spawn_blocking(move || {
                let _ = client.quit();
            })
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }
}

fn download_all(
    client: &mut FtpStream,
    remote_path: &str,
) -> Result<Vec<(String, Vec<u8>)>, EtlError> {
    let names = client
        .nlst(Some(remote_path))
        .map_err(|e| EtlError::FetchFailed(e.to_string()))?;

    let mut downloads = Vec::with_capacity(names.len());
    for name in names {
        let buffer = client
            .retr_as_buffer(&name)
            .map_err(|e| EtlError::FetchFailed(format!("{}: {}", name, e)))?;
        downloads.push((name, buffer.into_inner()));
    }
    Ok(downloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_core::redact_config;

    #[test]
    fn defaults_match_anonymous_ftp() {
        let mut payload = JsonMap::new();
        payload.insert("host".to_string(), json!("files.internal"));
        let connector = FtpConnector::from_config(&payload).unwrap();
        assert_eq!(connector.config.port, 21);
        assert_eq!(connector.config.username, "anonymous");
        assert!(connector.config.passive_mode);
        assert_eq!(connector.config.remote_base_path, "/");
    }

    #[test]
    fn redacted_config_hides_password() {
        let mut payload = JsonMap::new();
        payload.insert("host".to_string(), json!("files.internal"));
        payload.insert("password".to_string(), json!("pw"));
        let redacted = redact_config(&payload);
        assert_eq!(redacted["password"], json!("***"));
    }

    #[tokio::test]
    async fn fetch_before_connect_fails() {
        let mut payload = JsonMap::new();
        payload.insert("host".to_string(), json!("files.internal"));
        let mut connector = FtpConnector::from_config(&payload).unwrap();
        let err = connector.fetch("/outbound").await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }
}
