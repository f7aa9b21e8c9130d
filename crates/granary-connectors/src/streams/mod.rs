//! Stream micro-batch consumers (Kafka, AMQP, NATS).
//!
//! A fetch pulls messages until a bounded stop condition (max messages,
//! max duration, or the broker running dry) and writes the whole batch as
//! ONE staged Parquet file under the standard partition scheme. Consumer
//! positions are committed only after the file has been renamed into place,
//! giving at-least-once delivery into the lake.

pub mod amqp;
pub mod kafka;
pub mod nats;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

use granary_core::{frames, lake, EtlError, IngestedItem, IngestionResult, JsonMap};

/// Normalize one broker message into an event row.
pub(crate) fn message_record(
    topic: &str,
    key: Option<String>,
    payload: Option<&[u8]>,
    headers: Option<Value>,
    ts: DateTime<Utc>,
) -> JsonMap {
    let mut row = JsonMap::new();
    row.insert("topic".to_string(), json!(topic));
    row.insert(
        "key".to_string(),
        key.map(Value::String).unwrap_or(Value::Null),
    );
    row.insert(
        "value".to_string(),
        payload
            .map(|bytes| Value::String(String::from_utf8_lossy(bytes).into_owned()))
            .unwrap_or(Value::Null),
    );
    row.insert(
        "headers".to_string(),
        headers.map(|h| Value::String(h.to_string())).unwrap_or(Value::Null),
    );
    row.insert("ts".to_string(), json!(ts.to_rfc3339()));
    row
}

/// Stage a consumed batch and build the ingestion envelope.
///
/// An empty batch is a successful fetch with no items; otherwise the rows
/// land in one Parquet file and the envelope carries a single pre-staged
/// item pointing at it.
pub(crate) fn stage_micro_batch(
    protocol: &'static str,
    stream_name: &str,
    records: &[JsonMap],
    lake_root: &Path,
) -> Result<IngestionResult, EtlError> {
    if records.is_empty() {
        return Ok(IngestionResult::success(protocol, vec![])
            .with_metadata("stream", json!(stream_name))
            .with_metadata("messages", json!(0)));
    }

    let now = Utc::now();
    let target: PathBuf =
        lake::staged_file_path(lake_root, protocol, stream_name, &now, "parquet")?;
    let written = frames::write_rows_to_parquet(records, &target)?;
    let size_bytes = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);

    info!(
        protocol,
        stream = stream_name,
        rows = written,
        path = %target.display(),
        "staged stream micro-batch"
    );

    Ok(IngestionResult::success(
        protocol,
        vec![IngestedItem::pre_staged(stream_name, target, size_bytes)],
    )
    .with_metadata("stream", json!(stream_name))
    .with_metadata("messages", json!(records.len()))
    .with_metadata("format", json!("parquet")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_carries_all_fields() {
        let ts = Utc::now();
        let row = message_record(
            "events",
            Some("k1".to_string()),
            Some(br#"{"id":1}"#),
            Some(json!({"trace": "abc"})),
            ts,
        );
        assert_eq!(row["topic"], json!("events"));
        assert_eq!(row["key"], json!("k1"));
        assert_eq!(row["value"], json!(r#"{"id":1}"#));
        assert_eq!(row["headers"], json!(r#"{"trace":"abc"}"#));
        assert_eq!(row["ts"], json!(ts.to_rfc3339()));
    }

    #[test]
    fn missing_key_and_payload_are_null() {
        let row = message_record("events", None, None, None, Utc::now());
        assert_eq!(row["key"], Value::Null);
        assert_eq!(row["value"], Value::Null);
        assert_eq!(row["headers"], Value::Null);
    }

    #[test]
    fn empty_batch_produces_no_items() {
        let dir = tempfile::tempdir().unwrap();
        let result = stage_micro_batch("kafka", "events", &[], dir.path()).unwrap();
        assert!(result.success);
        assert!(result.items.is_empty());
        assert_eq!(result.metadata["messages"], json!(0));
    }

    #[test]
    fn batch_is_staged_as_one_parquet_file() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            message_record("events", Some("a".to_string()), Some(b"1"), None, Utc::now()),
            message_record("events", Some("b".to_string()), Some(b"2"), None, Utc::now()),
        ];
        let result = stage_micro_batch("kafka", "events", &records, dir.path()).unwrap();

        assert_eq!(result.items.len(), 1);
        let item = &result.items[0];
        let path = item.lake_path.as_ref().unwrap();
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("kafka").join("events")));
        assert_eq!(result.metadata["messages"], json!(2));
        assert!(item.size_bytes.unwrap() > 0);
        assert!(item.payload.is_none());
    }
}
