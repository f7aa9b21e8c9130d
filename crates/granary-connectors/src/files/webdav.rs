//! WebDAV source connector.
//!
//! Lists a collection with a depth-1 PROPFIND, downloads every non-collection
//! member, and stages the files like the other file connectors.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{EtlError, IngestionResult, JsonMap};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct WebdavConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_remote_base_path")]
    pub remote_base_path: String,
    #[serde(default = "default_lake_path")]
    pub lake_path: String,
    #[serde(default = "default_timeout", deserialize_with = "de::lenient_u64")]
    pub timeout_seconds: u64,
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

pub struct WebdavConnector {
    config: WebdavConfig,
    source_name: String,
    client: Option<reqwest::Client>,
}

impl WebdavConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("WEBDAV".to_string()),
            ..Default::default()
        };
        let merged =
            load_connection_config(Some(payload), &layers, &["base_url", "username", "password"])?;
        let config: WebdavConfig = typed_config("webdav", &merged)?;

        let source_name = Url::parse(&config.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "webdav".to_string());

        Ok(Self {
            config,
            source_name,
            client: None,
        })
    }

    fn propfind_method() -> Result<Method, EtlError> {
        Method::from_bytes(b"PROPFIND")
            .map_err(|e| EtlError::FetchFailed(format!("invalid PROPFIND method: {}", e)))
    }

    /// Absolute URL for an href returned in a multistatus response.
    fn href_url(&self, href: &str) -> Result<Url, EtlError> {
        let base = Url::parse(&self.config.base_url)
            .map_err(|e| EtlError::InvalidConfig(format!("invalid base_url: {}", e)))?;
        base.join(href)
            .map_err(|e| EtlError::FetchFailed(format!("invalid href '{}': {}", href, e)))
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(WebdavConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for WebdavConnector {
    fn protocol(&self) -> &'static str {
        "webdav"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        info!(base_url = %self.config.base_url, "connecting webdav connector");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .build()
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;

        // Validate credentials and reachability with a depth-0 PROPFIND.
        let response = client
            .request(Self::propfind_method()?, &self.config.base_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Depth", "0")
            .send()
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EtlError::ConnectionFailed(format!(
                "webdav validation returned {}",
                response.status()
            )));
        }

        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let client = self
            .client
            .as_ref()
            .ok_or(EtlError::NotConnected("webdav"))?;
        let remote_path = super::resolve_remote_path(query, &self.config.remote_base_path);
        let listing_url = self.href_url(remote_path)?;
        debug!(url = %listing_url, "listing webdav collection");

        let response = client
            .request(Self::propfind_method()?, listing_url.clone())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Depth", "1")
            .send()
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Ok(IngestionResult::failure(
                "webdav",
                format!("{} {}", status.as_u16(), snippet),
            ));
        }

        let entries = parse_multistatus(&body)?;
        let lake_root = PathBuf::from(&self.config.lake_path);
        let mut items = Vec::new();

        for entry in entries {
            if entry.is_collection {
                continue;
            }
            // The listed collection itself appears in its own response.
            if entry.href.trim_end_matches('/') == listing_url.path().trim_end_matches('/') {
                continue;
            }

            let file_url = self.href_url(&entry.href)?;
            debug!(url = %file_url, "downloading webdav file");
            let file_response = client
                .get(file_url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .send()
                .await
                .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
            if !file_response.status().is_success() {
                return Err(EtlError::FetchFailed(format!(
                    "{} while downloading {}",
                    file_response.status(),
                    entry.href
                )));
            }
            let bytes = file_response
                .bytes()
                .await
                .map_err(|e| EtlError::FetchFailed(e.to_string()))?;

            items.push(super::stage_download(
                &lake_root,
                "webdav",
                &self.source_name,
                &entry.href,
                &bytes,
            )?);
        }

        let count = items.len();
        Ok(IngestionResult::success("webdav", items)
            .with_metadata("remote_path", json!(remote_path))
            .with_metadata("downloaded_files", json!(count)))
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        self.client = None;
        Ok(())
    }
}

struct DavEntry {
    href: String,
    is_collection: bool,
}

/// Parse the hrefs of a PROPFIND multistatus response.
fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, EtlError> {
    let mut reader = Reader::from_str(xml);
    let mut entries = Vec::new();
    let mut current_href: Option<String> = None;
    let mut current_is_collection = false;
    let mut in_href = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => {
                    current_href = None;
                    current_is_collection = false;
                }
                b"href" => in_href = true,
                b"collection" => current_is_collection = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    current_is_collection = true;
                }
            }
            Ok(Event::Text(t)) => {
                if in_href {
                    let text = t
                        .unescape()
                        .map_err(|e| EtlError::FetchFailed(format!("invalid multistatus: {}", e)))?
                        .into_owned();
                    current_href = Some(text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"href" => in_href = false,
                b"response" => {
                    if let Some(href) = current_href.take() {
                        entries.push(DavEntry {
                            href,
                            is_collection: current_is_collection,
                        });
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(EtlError::FetchFailed(format!("invalid multistatus: {}", e))),
            _ => {}
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multistatus_separates_files_from_collections() {
        let xml = r#"<d:multistatus xmlns:d="DAV:">
            <d:response>
                <d:href>/exports/</d:href>
                <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
            </d:response>
            <d:response>
                <d:href>/exports/data.csv</d:href>
                <d:propstat><d:prop><d:resourcetype/></d:prop></d:propstat>
            </d:response>
        </d:multistatus>"#;
        let entries = parse_multistatus(xml).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_collection);
        assert_eq!(entries[1].href, "/exports/data.csv");
        assert!(!entries[1].is_collection);
    }

    #[test]
    fn source_name_is_the_host() {
        let mut payload = JsonMap::new();
        payload.insert("base_url".to_string(), json!("https://dav.internal/root"));
        payload.insert("username".to_string(), json!("u"));
        payload.insert("password".to_string(), json!("p"));
        let connector = WebdavConnector::from_config(&payload).unwrap();
        assert_eq!(connector.source_name, "dav.internal");
    }
}
