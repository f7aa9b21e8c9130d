//! Granary Connectors - protocol-pluggable extraction layer
//!
//! Every connector implements the same lifecycle (`connect`, `fetch`,
//! `close`) and returns the normalized [`IngestionResult`] envelope.
//! The [`ConnectorRegistry`] discovers implementations by the `protocol`
//! string in the supplied config:
//!
//! - SQL: `postgres`, `mssql`, `oracle`, `sqlite`
//! - HTTP: `http`, `soap`
//! - Files: `ftp`, `sftp`, `webdav`
//! - NoSQL: `mongodb`, `cassandra`, `neo4j`
//! - Streams: `kafka`, `amqp`, `nats`

pub mod connector;
pub mod files;
pub mod http;
pub mod nosql;
pub mod registry;
pub mod soap;
pub mod sql;
pub mod streams;

pub use connector::Connector;
pub use granary_core::{IngestedItem, IngestionResult, Payload};
pub use registry::ConnectorRegistry;
pub use sql::dw::{get_dw_engine, test_dw_connection};
pub use sql::incremental::fetch_incremental;
