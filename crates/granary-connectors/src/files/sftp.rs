//! SFTP source connector.
//!
//! Authenticates with a password or a private-key file. The ssh2 session is
//! blocking and moves across `spawn_blocking` like the FTP control channel.

use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use ssh2::Session;
use tracing::{debug, info};

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{EtlError, IngestionResult, JsonMap};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "de::lenient_u16")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default = "default_remote_base_path")]
    pub remote_base_path: String,
    #[serde(default = "default_lake_path")]
    pub lake_path: String,
    #[serde(default = "default_timeout", deserialize_with = "de::lenient_u64")]
    pub connect_timeout_seconds: u64,
}

fn default_port() -> u16 {
    22
}

fn default_remote_base_path() -> String {
    ".".to_string()
}

fn default_lake_path() -> String {
    "./lake".to_string()
}

fn default_timeout() -> u64 {
    30
}

pub struct SftpConnector {
    config: SftpConfig,
    source_name: String,
    session: Option<Session>,
}

impl std::fmt::Debug for SftpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConnector")
            .field("config", &self.config)
            .field("source_name", &self.source_name)
            .field("session", &self.session.is_some())
            .finish()
    }
}

impl SftpConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("SFTP".to_string()),
            ..Default::default()
        };
        let merged = load_connection_config(Some(payload), &layers, &["host", "username"])?;
        let config: SftpConfig = typed_config("sftp", &merged)?;

        if config.password.is_none() && config.private_key_path.is_none() {
            return Err(EtlError::InvalidConfig(
                "sftp requires a password or a private_key_path".to_string(),
            ));
        }

        let source_name = config.host.clone();
        Ok(Self {
            config,
            source_name,
            session: None,
        })
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(SftpConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for SftpConnector {
    fn protocol(&self) -> &'static str {
        "sftp"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        let config = self.config.clone();
        info!(host = %config.host, port = config.port, "connecting sftp connector");

        let session = tokio::task::spawn_blocking(move || -> Result<Session, EtlError> {
            use std::net::ToSocketAddrs;

            let addr = (config.host.as_str(), config.port)
                .to_socket_addrs()
                .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?
                .next()
                .ok_or_else(|| {
                    EtlError::ConnectionFailed(format!("cannot resolve host '{}'", config.host))
                })?;
            let stream = TcpStream::connect_timeout(
                &addr,
                std::time::Duration::from_secs(config.connect_timeout_seconds),
            )
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
            let mut session =
                Session::new().map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
            session.set_tcp_stream(stream);
            session
                .handshake()
                .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;

            if let Some(key_path) = &config.private_key_path {
                session
                    .userauth_pubkey_file(&config.username, None, Path::new(key_path), None)
                    .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
            } else if let Some(password) = &config.password {
                session
                    .userauth_password(&config.username, password)
                    .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
            }

            if !session.authenticated() {
                return Err(EtlError::ConnectionFailed(
                    "sftp authentication failed".to_string(),
                ));
            }
            Ok(session)
        })
        .await
        .map_err(|e| EtlError::ConnectionFailed(e.to_string()))??;

        self.session = Some(session);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let session = self.session.take().ok_or(EtlError::NotConnected("sftp"))?;
        let remote_path =
            super::resolve_remote_path(query, &self.config.remote_base_path).to_string();
        debug!(remote_path = %remote_path, "listing sftp directory");

        let listing_path = remote_path.clone();
        let (session, downloads) = tokio::task::spawn_blocking(
            move || -> (Session, Result<Vec<(String, Vec<u8>)>, EtlError>) {
                let result = download_all(&session, &listing_path);
                (session, result)
            },
        )
        .await
        .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
        self.session = Some(session);
        let downloads = downloads?;

        let lake_root = PathBuf::from(&self.config.lake_path);
        let mut items = Vec::with_capacity(downloads.len());
        for (remote_file, bytes) in &downloads {
            items.push(super::stage_download(
                &lake_root,
                "sftp",
                &self.source_name,
                remote_file,
                bytes,
            )?);
        }

        let count = items.len();
        Ok(IngestionResult::success("sftp", items)
            .with_metadata("remote_path", json!(remote_path))
            .with_metadata("downloaded_files", json!(count)))
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        if let Some(session) = self.session.take() {
            tokio::task::spawn_blocking(move || {
                let _ = session.disconnect(None, "closing", None);
            })
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }
}

fn download_all(session: &Session, remote_path: &str) -> Result<Vec<(String, Vec<u8>)>, EtlError> {
    let sftp = session
        .sftp()
        .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
    let entries = sftp
        .readdir(Path::new(remote_path))
        .map_err(|e| EtlError::FetchFailed(format!("{}: {}", remote_path, e)))?;

    let mut downloads = Vec::new();
    for (path, stat) in entries {
        if !stat.is_file() {
            continue;
        }
        let mut file = sftp
            .open(&path)
            .map_err(|e| EtlError::FetchFailed(format!("{}: {}", path.display(), e)))?;
        let mut bytes = Vec::with_capacity(stat.size.unwrap_or(0) as usize);
        file.read_to_end(&mut bytes)
            .map_err(|e| EtlError::FetchFailed(format!("{}: {}", path.display(), e)))?;
        downloads.push((path.display().to_string(), bytes));
    }
    Ok(downloads)
}
