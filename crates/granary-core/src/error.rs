//! Typed errors for the Granary framework.

use std::fmt;

/// Errors raised by configuration loading, connectors, staging, and the
/// warehouse layer.
#[derive(Debug)]
pub enum EtlError {
    /// Required config keys are absent or empty after the layered merge.
    MissingConfigKeys(Vec<String>),
    /// Config file extension is neither `.json` nor `.yaml`/`.yml`.
    UnsupportedConfigFormat(String),
    /// Config file path does not exist.
    ConfigFileNotFound(String),
    /// Config content did not deserialize to a key/value object.
    InvalidConfig(String),
    /// No connector factory registered for the protocol.
    UnknownProtocol(String),
    /// `fetch` was called before `connect`.
    NotConnected(&'static str),
    /// `fetch` was called with an empty query.
    EmptyQuery(&'static str),
    /// Failed to establish a connection to the external source.
    ConnectionFailed(String),
    /// A fetch against the external source failed.
    FetchFailed(String),
    /// Staging a payload to the lake failed.
    StagingFailed(String),
    /// DDL against the warehouse was rejected.
    SchemaFailed(String),
    /// Loading staged data into the warehouse failed.
    LoadFailed(String),
    /// A staged file referenced by the loader does not exist.
    FileNotFound(String),
    /// Writing to the audit table failed.
    AuditFailed(String),
}

impl fmt::Display for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtlError::MissingConfigKeys(keys) => {
                write!(f, "missing required connection config keys: {}", keys.join(", "))
            }
            EtlError::UnsupportedConfigFormat(ext) => {
                write!(f, "unsupported config format '{}': use JSON (.json) or YAML (.yaml/.yml)", ext)
            }
            EtlError::ConfigFileNotFound(path) => write!(f, "config file not found: {}", path),
            EtlError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            EtlError::UnknownProtocol(protocol) => write!(f, "unknown protocol: {}", protocol),
            EtlError::NotConnected(protocol) => {
                write!(f, "{} connector is not connected: call connect() first", protocol)
            }
            EtlError::EmptyQuery(protocol) => {
                write!(f, "empty query: {} connector requires a non-empty query", protocol)
            }
            EtlError::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            EtlError::FetchFailed(msg) => write!(f, "fetch failed: {}", msg),
            EtlError::StagingFailed(msg) => write!(f, "staging failed: {}", msg),
            EtlError::SchemaFailed(msg) => write!(f, "schema DDL failed: {}", msg),
            EtlError::LoadFailed(msg) => write!(f, "load failed: {}", msg),
            EtlError::FileNotFound(path) => write!(f, "file not found: {}", path),
            EtlError::AuditFailed(msg) => write!(f, "audit write failed: {}", msg),
        }
    }
}

impl std::error::Error for EtlError {}

impl From<sqlx::Error> for EtlError {
    fn from(e: sqlx::Error) -> Self {
        EtlError::FetchFailed(e.to_string())
    }
}

impl From<serde_json::Error> for EtlError {
    fn from(e: serde_json::Error) -> Self {
        EtlError::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_message_lists_keys() {
        let err = EtlError::MissingConfigKeys(vec!["host".to_string(), "database".to_string()]);
        assert_eq!(
            err.to_string(),
            "missing required connection config keys: host, database"
        );
    }

    #[test]
    fn unknown_protocol_message() {
        let err = EtlError::UnknownProtocol("carrier-pigeon".to_string());
        assert_eq!(err.to_string(), "unknown protocol: carrier-pigeon");
    }

    #[test]
    fn not_connected_and_empty_query_name_the_protocol() {
        assert!(EtlError::NotConnected("http").to_string().contains("not connected"));
        assert!(EtlError::EmptyQuery("http").to_string().contains("empty query"));
    }

    #[test]
    fn file_not_found_carries_path() {
        let err = EtlError::FileNotFound("/lake/missing.parquet".to_string());
        assert_eq!(err.to_string(), "file not found: /lake/missing.parquet");
    }
}
