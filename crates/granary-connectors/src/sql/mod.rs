//! SQL source connectors.
//!
//! Each protocol module builds a DB URL from its validated config and
//! yields a pooled engine through the connection cache; the shared
//! [`SqlConnection`] drives the connect/fetch/close lifecycle on top of it.

pub mod dw;
pub mod incremental;
pub mod mssql;
pub mod oracle;
pub mod postgres;
pub mod sqlite;

use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{Column, Row};
use tracing::debug;

use granary_core::{
    engine::get_or_create_engine, DbEngine, EtlError, IngestedItem, IngestionResult, JsonMap,
    Payload,
};

/// Shared state and behavior for all SQL connectors.
pub(crate) struct SqlConnection {
    protocol: &'static str,
    connection_type: &'static str,
    url: String,
    identity: JsonMap,
    connect_timeout_seconds: u64,
    reuse: bool,
    engine: Option<DbEngine>,
}

impl SqlConnection {
    pub(crate) fn new(
        protocol: &'static str,
        connection_type: &'static str,
        url: String,
        identity: JsonMap,
        connect_timeout_seconds: u64,
        reuse: bool,
    ) -> Self {
        Self {
            protocol,
            connection_type,
            url,
            identity,
            connect_timeout_seconds,
            reuse,
            engine: None,
        }
    }

    pub(crate) async fn connect(&mut self) -> Result<(), EtlError> {
        let url = self.url.clone();
        let timeout = self.connect_timeout_seconds;
        let engine = get_or_create_engine(
            self.connection_type,
            &self.identity,
            || async move { DbEngine::connect(&url, timeout).await },
            self.reuse,
        )
        .await?;
        engine.health_check().await?;
        self.engine = Some(engine);
        Ok(())
    }

    pub(crate) async fn fetch(&mut self, query: &str) -> Result<IngestionResult, EtlError> {
        let engine = self
            .engine
            .as_ref()
            .ok_or(EtlError::NotConnected(self.protocol))?;
        if query.trim().is_empty() {
            return Err(EtlError::EmptyQuery(self.protocol));
        }

        debug!(protocol = self.protocol, query, "executing source query");
        let rows = fetch_all_rows(engine, query).await?;
        let count = rows.len();
        Ok(
            IngestionResult::success(self.protocol, vec![IngestedItem::with_payload(
                Payload::Rows(rows),
            )])
            .with_metadata("rows", Value::from(count as u64)),
        )
    }

    pub(crate) async fn close(&mut self) -> Result<(), EtlError> {
        if let Some(engine) = self.engine.take() {
            if !self.reuse {
                engine.close().await;
            }
        }
        Ok(())
    }
}

/// Execute `query` and return every row as a column-name → value map.
pub(crate) async fn fetch_all_rows(
    engine: &DbEngine,
    query: &str,
) -> Result<Vec<JsonMap>, EtlError> {
    let rows = sqlx::query(query)
        .fetch_all(engine.pool())
        .await
        .map_err(|e| EtlError::FetchFailed(e.to_string()))?;
    Ok(rows.iter().map(row_to_json).collect())
}

pub(crate) fn row_to_json(row: &AnyRow) -> JsonMap {
    let mut map = JsonMap::new();
    for (index, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), decode_any_value(row, index));
    }
    map
}

/// Decode one column by trying progressively laxer types; columns the `Any`
/// driver cannot decode come back as null.
fn decode_any_value(row: &AnyRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    Value::Null
}
