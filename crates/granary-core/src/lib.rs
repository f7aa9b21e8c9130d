//! Granary Core - shared plumbing for the ETL framework
//!
//! This crate provides the pieces every other Granary crate builds on:
//! - Layered connection configuration with strict precedence
//! - Sensitive-field redaction for logs
//! - SQL dialect handling (quoting, placeholders, type mapping)
//! - Cached database engines and per-thread HTTP sessions
//! - The ingestion data contract returned by every connector
//! - Data-lake partition paths and columnar file writing

pub mod config;
pub mod contract;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod frames;
pub mod lake;
pub mod redact;
pub mod session;

pub use config::{load_connection_config, load_connector_config, ConfigLayers};
pub use contract::{IngestedItem, IngestionResult, Payload};
pub use dialect::Dialect;
pub use engine::{close_all_engines, get_or_create_engine, DbEngine};
pub use error::EtlError;
pub use redact::redact_config;
pub use session::{close_all_sessions, get_or_create_session};

/// JSON object type used for configs and row payloads throughout Granary.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
