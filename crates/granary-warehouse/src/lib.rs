//! Granary Warehouse - staging and DW loading
//!
//! The hop between extraction and the warehouse:
//! - Staging writer: envelope → partitioned Parquet files
//! - Schema manager: idempotent CREATE plus additive ALTER
//! - Loader: staged files → batched inserts with lineage
//! - Audit store: one `etl_audit_log` row per pipeline run

pub mod audit;
pub mod loader;
pub mod schema;
pub mod staging;

pub use audit::{ensure_audit_table, write_audit_record, AuditRecord, RunStatus};
pub use loader::load_parquet_files;
pub use schema::ensure_table_exists;
pub use staging::write_ingestion_result;
