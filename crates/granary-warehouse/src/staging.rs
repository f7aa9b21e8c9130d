//! Staging writer: ingestion envelopes → partitioned Parquet.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use granary_core::{frames, lake, EtlError, IngestionResult};

/// Write every item of an ingestion result to the lake.
///
/// A failed envelope or one with no items stages nothing. Items that carry
/// a `lake_path` were staged by their connector and pass through unchanged.
/// Everything else is materialized to rows, stamped with `_ingested_at`,
/// and written as one Parquet file per item at the partition path. Paths
/// come back in creation order.
pub fn write_ingestion_result(
    result: &IngestionResult,
    lake_root: &Path,
    source_name: &str,
) -> Result<Vec<PathBuf>, EtlError> {
    if !result.success || result.items.is_empty() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for item in &result.items {
        if let Some(lake_path) = &item.lake_path {
            paths.push(lake_path.clone());
            continue;
        }

        let mut rows = match &item.payload {
            Some(payload) => payload.to_rows(),
            None => continue,
        };
        if rows.is_empty() {
            continue;
        }

        let now = Utc::now();
        let ingested_at = now.to_rfc3339();
        for row in &mut rows {
            row.insert(
                "_ingested_at".to_string(),
                Value::String(ingested_at.clone()),
            );
        }

        let target =
            lake::staged_file_path(lake_root, &result.protocol, source_name, &now, "parquet")?;
        let written = frames::write_rows_to_parquet(&rows, &target)?;
        info!(
            protocol = %result.protocol,
            source = source_name,
            rows = written,
            path = %target.display(),
            "staged ingestion item"
        );
        paths.push(target);
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_core::{IngestedItem, Payload};
    use serde_json::json;

    fn rows_item(values: Value) -> IngestedItem {
        IngestedItem::with_payload(Payload::from_value(values))
    }

    #[test]
    fn failed_envelope_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let result = IngestionResult::failure("http", "boom");
        let paths = write_ingestion_result(&result, dir.path(), "src").unwrap();
        assert!(paths.is_empty());
    }

    #[test]
    fn empty_items_stage_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let result = IngestionResult::success("http", vec![]);
        let paths = write_ingestion_result(&result, dir.path(), "src").unwrap();
        assert!(paths.is_empty());
    }

    #[test]
    fn partition_path_shape_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let result = IngestionResult::success(
            "sqlite",
            vec![rows_item(json!([{"id": 1}, {"id": 2}]))],
        );
        let paths = write_ingestion_result(&result, dir.path(), "users.daily").unwrap();
        assert_eq!(paths.len(), 1);

        let relative = paths[0].strip_prefix(dir.path()).unwrap();
        let parts: Vec<&str> = relative.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "sqlite");
        assert_eq!(parts[1], "users.daily");
        // YYYY-MM-DD partition day
        assert_eq!(parts[2].len(), 10);
        assert_eq!(&parts[2][4..5], "-");
        // <safe_source>_<utc_timestamp>.parquet
        let file = parts[3];
        assert!(file.starts_with("users_daily_"));
        assert!(file.ends_with("Z.parquet"));
        let stamp = file
            .trim_start_matches("users_daily_")
            .trim_end_matches("Z.parquet");
        assert_eq!(stamp.len(), "YYYYMMDDTHHMMSS".len() + 6);
        assert!(stamp[..8].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(&stamp[8..9], "T");
    }

    #[test]
    fn rows_carry_the_ingested_at_stamp() {
        use arrow::array::StringArray;
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let dir = tempfile::tempdir().unwrap();
        let result =
            IngestionResult::success("sqlite", vec![rows_item(json!([{"id": 1}]))]);
        let paths = write_ingestion_result(&result, dir.path(), "src").unwrap();

        let file = std::fs::File::open(&paths[0]).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
        let batch = &batches[0];

        let column_index = batch.schema().index_of("_ingested_at").unwrap();
        let stamps = batch
            .column(column_index)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        // ISO-8601 UTC
        assert!(stamps.value(0).contains('T'));
        assert!(stamps.value(0).contains("+00:00") || stamps.value(0).ends_with('Z'));
    }

    #[test]
    fn pre_staged_items_pass_through_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("already.parquet");
        std::fs::write(&staged, b"parquet-bytes").unwrap();

        let result = IngestionResult::success(
            "kafka",
            vec![IngestedItem::pre_staged("events", staged.clone(), 13)],
        );
        let paths = write_ingestion_result(&result, dir.path(), "events").unwrap();
        assert_eq!(paths, vec![staged]);
    }

    #[test]
    fn scalar_payload_becomes_single_synthetic_row() {
        let dir = tempfile::tempdir().unwrap();
        let result = IngestionResult::success("http", vec![rows_item(json!("raw body"))]);
        let paths = write_ingestion_result(&result, dir.path(), "src").unwrap();
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn item_without_payload_or_path_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let result = IngestionResult::success("http", vec![IngestedItem::default()]);
        let paths = write_ingestion_result(&result, dir.path(), "src").unwrap();
        assert!(paths.is_empty());
    }

    #[test]
    fn paths_come_back_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let result = IngestionResult::success(
            "http",
            vec![
                rows_item(json!([{"n": 1}])),
                rows_item(json!([{"n": 2}])),
                rows_item(json!([{"n": 3}])),
            ],
        );
        let paths = write_ingestion_result(&result, dir.path(), "src").unwrap();
        assert_eq!(paths.len(), 3);
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }
}
