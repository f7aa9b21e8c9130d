//! SOAP source connector.
//!
//! Binds to a WSDL at connect time (resolving the service endpoint from the
//! `soap:address` element unless one is configured explicitly) and invokes
//! one operation per fetch with a SOAP 1.1 envelope. Basic-auth credentials
//! must be supplied as a pair or not at all.

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use granary_core::config::{de, load_connection_config, typed_config, ConfigLayers};
use granary_core::{EtlError, IngestedItem, IngestionResult, JsonMap, Payload};

use crate::connector::Connector;

#[derive(Debug, Clone, Deserialize)]
pub struct SoapConfig {
    pub wsdl_url: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout", deserialize_with = "de::lenient_u64")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug)]
pub struct SoapConnector {
    config: SoapConfig,
    client: Option<reqwest::Client>,
    endpoint: Option<String>,
}

impl SoapConnector {
    pub fn from_config(payload: &JsonMap) -> Result<Self, EtlError> {
        let layers = ConfigLayers {
            env_prefix: Some("SOAP".to_string()),
            ..Default::default()
        };
        let merged = load_connection_config(Some(payload), &layers, &["wsdl_url"])?;
        let config: SoapConfig = typed_config("soap", &merged)?;

        if config.username.is_some() != config.password.is_some() {
            return Err(EtlError::InvalidConfig(
                "provide both username and password for SOAP basic authentication".to_string(),
            ));
        }

        Ok(Self {
            config,
            client: None,
            endpoint: None,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => request.basic_auth(username, Some(password)),
            _ => request,
        }
    }
}

pub fn factory(payload: &JsonMap) -> Result<Box<dyn Connector>, EtlError> {
    Ok(Box::new(SoapConnector::from_config(payload)?))
}

#[async_trait]
impl Connector for SoapConnector {
    fn protocol(&self) -> &'static str {
        "soap"
    }

    async fn connect(&mut self) -> Result<(), EtlError> {
        info!(wsdl_url = %self.config.wsdl_url, "binding soap connector to wsdl");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .build()
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;

        let request = self.authorized(client.get(&self.config.wsdl_url));
        let response = request
            .send()
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EtlError::ConnectionFailed(format!(
                "WSDL fetch returned {}",
                response.status()
            )));
        }
        let wsdl = response
            .text()
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;

        let endpoint = match &self.config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => wsdl_service_endpoint(&wsdl).ok_or_else(|| {
                EtlError::ConnectionFailed(
                    "WSDL carries no soap:address endpoint; set 'endpoint' explicitly".to_string(),
                )
            })?,
        };
        debug!(%endpoint, "resolved soap endpoint");

        self.client = Some(client);
        self.endpoint = Some(endpoint);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let client = self.client.as_ref().ok_or(EtlError::NotConnected("soap"))?;
        let endpoint = self
            .endpoint
            .clone()
            .ok_or(EtlError::NotConnected("soap"))?;
        let operation = query.trim();
        if operation.is_empty() {
            return Err(EtlError::EmptyQuery("soap"));
        }

        let envelope = build_envelope(operation);
        let request = self
            .authorized(client.post(&endpoint))
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", format!("\"{}\"", operation))
            .body(envelope);

        let response = request
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
                "soap",
                format!("{} {}", status.as_u16(), snippet),
            ));
        }

        let row = parse_body_fields(&body)?;
        Ok(
            IngestionResult::success("soap", vec![IngestedItem::with_payload(Payload::Row(row))])
                .with_metadata("operation", json!(operation)),
        )
    }

    async fn close(&mut self) -> Result<(), EtlError> {
        self.client = None;
        self.endpoint = None;
        Ok(())
    }
}

fn build_envelope(operation: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
            "<soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">",
            "<soapenv:Header/>",
            "<soapenv:Body><{op}/></soapenv:Body>",
            "</soapenv:Envelope>"
        ),
        op = operation
    )
}

/// Pull the first `soap:address location` out of a WSDL document.
fn wsdl_service_endpoint(wsdl: &str) -> Option<String> {
    let mut reader = Reader::from_str(wsdl);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"address" {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"location" {
                            if let Ok(value) = attr.unescape_value() {
                                return Some(value.into_owned());
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Flatten the leaf elements of the SOAP body into a field map.
fn parse_body_fields(xml: &str) -> Result<JsonMap, EtlError> {
    let mut reader = Reader::from_str(xml);
    let mut row = JsonMap::new();
    let mut in_body = false;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "Body" {
                    in_body = true;
                } else if in_body {
                    current = Some(name);
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Body" {
                    in_body = false;
                }
                current = None;
            }
            Ok(Event::Text(t)) => {
                if in_body {
                    if let Some(field) = &current {
                        let text = t
                            .unescape()
                            .map_err(|e| EtlError::FetchFailed(format!("invalid SOAP body: {}", e)))?
                            .trim()
                            .to_string();
                        if !text.is_empty() {
                            row.insert(field.clone(), Value::String(text));
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EtlError::FetchFailed(format!("invalid SOAP body: {}", e))),
            _ => {}
        }
    }

    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wraps_the_operation() {
        let envelope = build_envelope("GetQuote");
        assert!(envelope.contains("<soapenv:Body><GetQuote/></soapenv:Body>"));
    }

    #[test]
    fn wsdl_endpoint_is_extracted() {
        let wsdl = r#"<definitions xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/">
            <service><port>
                <soap:address location="http://svc.internal/soap"/>
            </port></service>
        </definitions>"#;
        assert_eq!(
            wsdl_service_endpoint(wsdl).unwrap(),
            "http://svc.internal/soap"
        );
    }

    #[test]
    fn body_fields_are_flattened() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
            <soap:Body><GetQuoteResponse>
                <symbol>ACME</symbol>
                <price>12.5</price>
            </GetQuoteResponse></soap:Body>
        </soap:Envelope>"#;
        let row = parse_body_fields(xml).unwrap();
        assert_eq!(row["symbol"], Value::String("ACME".to_string()));
        assert_eq!(row["price"], Value::String("12.5".to_string()));
    }

    #[test]
    fn unmatched_credentials_are_rejected() {
        let mut payload = JsonMap::new();
        payload.insert("wsdl_url".to_string(), json!("http://svc.internal?wsdl"));
        payload.insert("username".to_string(), json!("user"));
        let err = SoapConnector::from_config(&payload).unwrap_err();
        assert!(err.to_string().contains("basic authentication"));
    }
}
