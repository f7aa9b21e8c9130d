//! Audit store: the `etl_audit_log` table.
//!
//! One row per terminated pipeline run. The table is a published interface
//! read by downstream dashboards; columns only ever grow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use granary_core::{DbEngine, EtlError};

pub const AUDIT_TABLE: &str = "etl_audit_log";

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

/// One audit row describing a terminated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub source_name: String,
    pub protocol: String,
    pub target_table: String,
    pub status: RunStatus,
    pub rows_loaded: i64,
    pub parquet_files: i64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Ensure the audit table exists. Runs in its own transaction.
pub async fn ensure_audit_table(engine: &DbEngine) -> Result<(), EtlError> {
    let dialect = engine.dialect();
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         id {pk}, \
         run_id TEXT NOT NULL, \
         pipeline_name TEXT NOT NULL, \
         source_name TEXT NOT NULL, \
         protocol TEXT NOT NULL, \
         target_table TEXT NOT NULL, \
         status TEXT NOT NULL, \
         rows_loaded BIGINT, \
         parquet_files BIGINT, \
         error_message TEXT, \
         started_at {ts} NOT NULL, \
         finished_at {ts})",
        table = dialect.quote_ident(AUDIT_TABLE),
        pk = dialect.autoincrement_pk(),
        ts = dialect.timestamp_type(),
    );

    let mut tx = engine
        .pool()
        .begin()
        .await
        .map_err(|e| EtlError::AuditFailed(e.to_string()))?;
    sqlx::query(&ddl)
        .execute(&mut *tx)
        .await
        .map_err(|e| EtlError::AuditFailed(e.to_string()))?;
    tx.commit()
        .await
        .map_err(|e| EtlError::AuditFailed(e.to_string()))?;
    info!("audit table ensured");
    Ok(())
}

/// Append exactly one audit row. Runs in its own transaction.
pub async fn write_audit_record(engine: &DbEngine, record: &AuditRecord) -> Result<(), EtlError> {
    let dialect = engine.dialect();
    let sql = format!(
        "INSERT INTO {table} (\
         run_id, pipeline_name, source_name, protocol, target_table, \
         status, rows_loaded, parquet_files, error_message, started_at, finished_at\
         ) VALUES ({p1}, {p2}, {p3}, {p4}, {p5}, {p6}, {p7}, {p8}, {p9}, {p10}, {p11})",
        table = dialect.quote_ident(AUDIT_TABLE),
        p1 = dialect.placeholder(1),
        p2 = dialect.placeholder(2),
        p3 = dialect.placeholder(3),
        p4 = dialect.placeholder(4),
        p5 = dialect.placeholder(5),
        p6 = dialect.placeholder(6),
        p7 = dialect.placeholder(7),
        p8 = dialect.placeholder(8),
        p9 = dialect.placeholder(9),
        p10 = dialect.cast_timestamp(&dialect.placeholder(10)),
        p11 = dialect.cast_timestamp(&dialect.placeholder(11)),
    );

    let mut tx = engine
        .pool()
        .begin()
        .await
        .map_err(|e| EtlError::AuditFailed(e.to_string()))?;
    sqlx::query(&sql)
        .bind(record.run_id.to_string())
        .bind(&record.pipeline_name)
        .bind(&record.source_name)
        .bind(&record.protocol)
        .bind(&record.target_table)
        .bind(record.status.as_str())
        .bind(record.rows_loaded)
        .bind(record.parquet_files)
        .bind(record.error_message.as_deref())
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.map(|ts| ts.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(|e| EtlError::AuditFailed(e.to_string()))?;
    tx.commit()
        .await
        .map_err(|e| EtlError::AuditFailed(e.to_string()))?;

    info!(
        run_id = %record.run_id,
        status = record.status.as_str(),
        "audit record written"
    );
    Ok(())
}
