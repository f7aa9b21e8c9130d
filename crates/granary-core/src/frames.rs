//! JSON rows to Arrow record batches and columnar files.
//!
//! Column types are inferred from the payload scalar types: integers become
//! `Int64`, floats `Float64`, booleans `Boolean`, everything else (including
//! nested values, which are re-encoded as JSON text) `Utf8`. Inference is
//! null-tolerant; a column that only ever holds null is typed as text.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde_json::Value;

use crate::error::EtlError;
use crate::lake::publish_atomic;
use crate::JsonMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int,
    Float,
    Bool,
    Text,
}

impl ColumnKind {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnKind::Bool),
            Value::Number(n) if n.as_i64().is_some() => Some(ColumnKind::Int),
            Value::Number(_) => Some(ColumnKind::Float),
            _ => Some(ColumnKind::Text),
        }
    }

    fn unify(a: ColumnKind, b: ColumnKind) -> ColumnKind {
        match (a, b) {
            (x, y) if x == y => x,
            (ColumnKind::Int, ColumnKind::Float) | (ColumnKind::Float, ColumnKind::Int) => {
                ColumnKind::Float
            }
            _ => ColumnKind::Text,
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            ColumnKind::Int => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

/// Union of column names across all rows, in first-seen order.
fn column_order(rows: &[JsonMap]) -> Vec<String> {
    let mut order = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                order.push(key.clone());
            }
        }
    }
    order
}

fn infer_kind(rows: &[JsonMap], column: &str) -> ColumnKind {
    rows.iter()
        .filter_map(|row| row.get(column).and_then(ColumnKind::of))
        .fold(None, |acc, kind| {
            Some(match acc {
                None => kind,
                Some(prev) => ColumnKind::unify(prev, kind),
            })
        })
        .unwrap_or(ColumnKind::Text)
}

fn text_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Convert JSON row maps to one Arrow record batch.
pub fn rows_to_record_batch(rows: &[JsonMap]) -> Result<RecordBatch, EtlError> {
    let order = column_order(rows);
    if order.is_empty() {
        return Err(EtlError::StagingFailed(
            "cannot build a record batch from rows with no columns".to_string(),
        ));
    }

    let mut fields = Vec::with_capacity(order.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(order.len());

    for name in &order {
        let kind = infer_kind(rows, name);
        fields.push(Field::new(name, kind.data_type(), true));

        let array: ArrayRef = match kind {
            ColumnKind::Int => {
                let values: Vec<Option<i64>> = rows
                    .iter()
                    .map(|row| row.get(name).and_then(Value::as_i64))
                    .collect();
                Arc::new(Int64Array::from(values))
            }
            ColumnKind::Float => {
                let values: Vec<Option<f64>> = rows
                    .iter()
                    .map(|row| row.get(name).and_then(Value::as_f64))
                    .collect();
                Arc::new(Float64Array::from(values))
            }
            ColumnKind::Bool => {
                let values: Vec<Option<bool>> = rows
                    .iter()
                    .map(|row| row.get(name).and_then(Value::as_bool))
                    .collect();
                Arc::new(BooleanArray::from(values))
            }
            ColumnKind::Text => {
                let values: Vec<Option<String>> = rows
                    .iter()
                    .map(|row| row.get(name).and_then(text_cell))
                    .collect();
                Arc::new(StringArray::from(values))
            }
        };
        columns.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, columns).map_err(|e| EtlError::StagingFailed(e.to_string()))
}

/// Write JSON rows as a Parquet file, published atomically at `target`.
/// Returns the number of rows written.
pub fn write_rows_to_parquet(rows: &[JsonMap], target: &Path) -> Result<u64, EtlError> {
    let batch = rows_to_record_batch(rows)?;

    let mut buf: Vec<u8> = Vec::new();
    {
        let props = WriterProperties::builder()
            .set_compression(parquet::basic::Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
            .map_err(|e| EtlError::StagingFailed(e.to_string()))?;
        writer
            .write(&batch)
            .map_err(|e| EtlError::StagingFailed(e.to_string()))?;
        writer
            .close()
            .map_err(|e| EtlError::StagingFailed(e.to_string()))?;
    }

    publish_atomic(&buf, target)?;
    Ok(batch.num_rows() as u64)
}
