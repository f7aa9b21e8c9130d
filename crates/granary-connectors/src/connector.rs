//! Connector lifecycle contract.

use std::fmt;

use async_trait::async_trait;

use granary_core::{EtlError, IngestionResult};

/// Uniform lifecycle for every source connector.
///
/// A connector is constructed with resolved config, enters the connected
/// state via [`connect`](Connector::connect), may service many
/// [`fetch`](Connector::fetch) calls, and terminates via
/// [`close`](Connector::close) (idempotent). `fetch` before `connect` fails
/// with a not-connected error; cached engine/session handles survive
/// `close` and are only released by the global `close_all` calls.
#[async_trait]
pub trait Connector: Send {
    /// Protocol tag this connector serves, e.g. `"postgres"`.
    fn protocol(&self) -> &'static str;

    /// Initialize and validate access to the external source.
    async fn connect(&mut self) -> Result<(), EtlError>;

    /// Fetch source data and return it in the standardized envelope.
    ///
    /// Remote failures may surface either as an error or as a
    /// `success = false` envelope with `metadata.error` set; the pipeline
    /// treats both as a failed run.
    async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError>;

    /// Release connector-local resources.
    async fn close(&mut self) -> Result<(), EtlError>;
}

impl fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("protocol", &self.protocol())
            .finish()
    }
}
