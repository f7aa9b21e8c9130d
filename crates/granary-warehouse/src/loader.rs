//! DW loader: staged Parquet files → batched inserts with lineage.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::info;

use granary_core::{DbEngine, EtlError};

use crate::schema::ensure_table_exists;

/// Load staged Parquet files into the target table, in path order.
///
/// Each file gets the table schema ensured first, then its rows appended
/// with `_source_file` set to the staged file's basename. Empty files are
/// skipped. Returns the total number of rows inserted.
pub async fn load_parquet_files(
    engine: &DbEngine,
    paths: &[PathBuf],
    table: &str,
    dw_schema: Option<&str>,
) -> Result<u64, EtlError> {
    let mut total_rows = 0u64;

    for path in paths {
        total_rows += load_one_file(engine, path, table, dw_schema).await?;
    }

    Ok(total_rows)
}

async fn load_one_file(
    engine: &DbEngine,
    path: &Path,
    table: &str,
    dw_schema: Option<&str>,
) -> Result<u64, EtlError> {
    if !path.exists() {
        return Err(EtlError::FileNotFound(path.display().to_string()));
    }

    let file = File::open(path).map_err(|e| EtlError::LoadFailed(format!("{}: {}", path.display(), e)))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| EtlError::LoadFailed(format!("{}: {}", path.display(), e)))?;
    let file_schema = builder.schema().clone();
    let reader = builder
        .build()
        .map_err(|e| EtlError::LoadFailed(format!("{}: {}", path.display(), e)))?;

    let batches: Vec<RecordBatch> = reader
        .collect::<Result<_, _>>()
        .map_err(|e| EtlError::LoadFailed(format!("{}: {}", path.display(), e)))?;
    let row_count: usize = batches.iter().map(|b| b.num_rows()).sum();
    if row_count == 0 {
        info!(path = %path.display(), "skipping empty staged file");
        return Ok(0);
    }

    ensure_table_exists(engine, table, &file_schema, dw_schema).await?;

    let source_file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let dialect = engine.dialect();
    let qualified = dialect.qualified_table(dw_schema, table);
    let mut column_names: Vec<String> = file_schema
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect();
    column_names.push("_source_file".to_string());

    let quoted: Vec<String> = column_names
        .iter()
        .map(|name| dialect.quote_ident(name))
        .collect();
    let placeholders: Vec<String> = (1..=column_names.len())
        .map(|position| dialect.placeholder(position))
        .collect();
    let insert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified,
        quoted.join(", "),
        placeholders.join(", ")
    );

    let mut tx = engine
        .pool()
        .begin()
        .await
        .map_err(|e| EtlError::LoadFailed(e.to_string()))?;

    for batch in &batches {
        for row in 0..batch.num_rows() {
            let mut query = sqlx::query(&insert_sql);
            for column in batch.columns() {
                query = bind_cell(query, column, row)?;
            }
            query = query.bind(source_file.clone());
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| EtlError::LoadFailed(e.to_string()))?;
        }
    }

    tx.commit()
        .await
        .map_err(|e| EtlError::LoadFailed(e.to_string()))?;

    info!(
        path = %path.display(),
        table = %qualified,
        rows = row_count,
        "loaded staged file into warehouse"
    );
    Ok(row_count as u64)
}

type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>;

/// Bind one Arrow cell, preserving scalar types where the `Any` driver has
/// them and falling back to display text for everything else.
fn bind_cell<'q>(
    query: AnyQuery<'q>,
    column: &ArrayRef,
    row: usize,
) -> Result<AnyQuery<'q>, EtlError> {
    if column.is_null(row) {
        return Ok(match column.data_type() {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => query.bind(None::<i64>),
            DataType::Float16 | DataType::Float32 | DataType::Float64 => query.bind(None::<f64>),
            DataType::Boolean => query.bind(None::<bool>),
            _ => query.bind(None::<String>),
        });
    }

    let bound = match column.data_type() {
        DataType::Int64 => {
            let array = downcast::<Int64Array>(column)?;
            query.bind(array.value(row))
        }
        DataType::Float64 => {
            let array = downcast::<Float64Array>(column)?;
            query.bind(array.value(row))
        }
        DataType::Boolean => {
            let array = downcast::<BooleanArray>(column)?;
            query.bind(array.value(row))
        }
        DataType::Utf8 => {
            let array = downcast::<StringArray>(column)?;
            query.bind(array.value(row).to_string())
        }
        _ => {
            let rendered = array_value_to_string(column, row)
                .map_err(|e| EtlError::LoadFailed(e.to_string()))?;
            query.bind(rendered)
        }
    };
    Ok(bound)
}

fn downcast<T: 'static>(column: &ArrayRef) -> Result<&T, EtlError> {
    column
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| EtlError::LoadFailed("unexpected array type".to_string()))
}
