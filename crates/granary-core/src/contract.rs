//! The ingestion data contract returned by every connector fetch.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JsonMap;

/// One fetched payload in the shape staging actually handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// A single record, one row.
    Row(JsonMap),
    /// An ordered batch of records, one row each.
    Rows(Vec<JsonMap>),
    /// Anything else becomes one row with a synthetic `payload` field.
    Scalar(Value),
}

impl Payload {
    /// Materialize the payload as row maps. Non-map members of a batch and
    /// scalars are wrapped under a synthetic `payload` key.
    pub fn to_rows(&self) -> Vec<JsonMap> {
        match self {
            Payload::Row(map) => vec![map.clone()],
            Payload::Rows(rows) => rows.clone(),
            Payload::Scalar(Value::Null) => Vec::new(),
            Payload::Scalar(value) => vec![wrap_scalar(value.clone())],
        }
    }

    /// Build a payload from an arbitrary JSON value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Payload::Row(map),
            Value::Array(items) => {
                let rows = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(map) => map,
                        other => wrap_scalar(other),
                    })
                    .collect();
                Payload::Rows(rows)
            }
            other => Payload::Scalar(other),
        }
    }
}

fn wrap_scalar(value: Value) -> JsonMap {
    let mut row = JsonMap::new();
    row.insert("payload".to_string(), value);
    row
}

/// One logical unit produced by a fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestedItem {
    /// Where the item came from on the remote side, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    /// Already-staged local file; the staging writer passes it through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lake_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,
}

impl IngestedItem {
    pub fn with_payload(payload: Payload) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    /// An item that was staged directly by the connector.
    pub fn pre_staged(source_path: impl Into<String>, lake_path: PathBuf, size_bytes: u64) -> Self {
        Self {
            source_path: Some(source_path.into()),
            lake_path: Some(lake_path),
            size_bytes: Some(size_bytes),
            ..Default::default()
        }
    }
}

/// Envelope returned by every connector `fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionResult {
    pub protocol: String,
    pub success: bool,
    #[serde(default)]
    pub items: Vec<IngestedItem>,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl IngestionResult {
    pub fn success(protocol: impl Into<String>, items: Vec<IngestedItem>) -> Self {
        Self {
            protocol: protocol.into(),
            success: true,
            items,
            metadata: JsonMap::new(),
        }
    }

    /// A failed fetch; `metadata.error` carries the cause.
    pub fn failure(protocol: impl Into<String>, error: impl Into<String>) -> Self {
        let mut metadata = JsonMap::new();
        metadata.insert("error".to_string(), Value::String(error.into()));
        Self {
            protocol: protocol.into(),
            success: false,
            items: Vec::new(),
            metadata,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_payload_is_one_row() {
        let payload = Payload::from_value(json!({"id": 1}));
        let rows = payload.to_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[test]
    fn array_payload_is_n_rows_with_scalar_members_wrapped() {
        let payload = Payload::from_value(json!([{"id": 1}, "stray", 3]));
        let rows = payload.to_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[1]["payload"], json!("stray"));
        assert_eq!(rows[2]["payload"], json!(3));
    }

    #[test]
    fn scalar_payload_gets_synthetic_field() {
        let rows = Payload::from_value(json!(42)).to_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["payload"], json!(42));
    }

    #[test]
    fn null_scalar_yields_no_rows() {
        assert!(Payload::Scalar(Value::Null).to_rows().is_empty());
    }

    #[test]
    fn failure_envelope_carries_error() {
        let result = IngestionResult::failure("http", "boom");
        assert!(!result.success);
        assert!(result.items.is_empty());
        assert_eq!(result.error_message(), Some("boom"));
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let result = IngestionResult::success(
            "sqlite",
            vec![IngestedItem::with_payload(Payload::from_value(json!([{"a": 1}])))],
        )
        .with_metadata("rows", json!(1));
        let encoded = serde_json::to_string(&result).unwrap();
        let decoded: IngestionResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.protocol, "sqlite");
        assert!(decoded.success);
        assert_eq!(decoded.items.len(), 1);
    }
}
