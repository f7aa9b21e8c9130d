//! Pipeline orchestrator: the run-id state machine.
//!
//! `Init → Connecting → Fetching → (Staging → Loading → Done_Success) |
//! Done_Failure`. Terminal states write exactly one audit row. The
//! connector is closed after fetch on every path; cached engine/session
//! handles are exempt and live until the global close-all calls.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use granary_connectors::ConnectorRegistry;
use granary_core::{DbEngine, JsonMap};
use granary_warehouse::{
    ensure_audit_table, load_parquet_files, write_audit_record, write_ingestion_result,
    AuditRecord, RunStatus,
};

/// Outcome of one pipeline run, JSON-printable for the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub rows_loaded: u64,
    pub parquet_files: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_seconds: f64,
}

enum Execution {
    /// The connector reported failure in its envelope.
    EnvelopeFailure(String),
    /// Staging and loading completed.
    Loaded { rows: u64, paths: Vec<PathBuf> },
}

/// Orchestrate a full ETL run: fetch, stage, load, audit.
///
/// The envelope-failure path returns a failure outcome; every other error
/// writes a failure audit row and propagates. Failing to write the success
/// audit is itself a run failure.
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
    registry: &ConnectorRegistry,
    connector_config: &JsonMap,
    query: &str,
    source_name: &str,
    target_table: &str,
    lake_root: &Path,
    dw: &DbEngine,
    dw_schema: Option<&str>,
    pipeline_name: &str,
) -> Result<RunOutcome> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let protocol = connector_config
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    info!(%run_id, pipeline = pipeline_name, source = source_name, protocol = %protocol, "starting pipeline run");
    ensure_audit_table(dw).await?;

    let audit_base = AuditBase {
        run_id,
        pipeline_name,
        source_name,
        protocol: &protocol,
        target_table,
        started_at,
    };

    match execute(registry, connector_config, query, source_name, target_table, lake_root, dw, dw_schema).await {
        Ok(Execution::EnvelopeFailure(message)) => {
            let finished_at = Utc::now();
            if let Err(audit_err) = write_audit_record(
                dw,
                &audit_base.record(RunStatus::Failure, 0, 0, Some(message.clone()), finished_at),
            )
            .await
            {
                error!(%run_id, error = %audit_err, "failed to write failure audit");
            }
            Ok(RunOutcome {
                run_id,
                status: RunStatus::Failure,
                rows_loaded: 0,
                parquet_files: 0,
                error: Some(message),
                duration_seconds: seconds_between(started_at, finished_at),
            })
        }
        Ok(Execution::Loaded { rows, paths }) => {
            let finished_at = Utc::now();
            write_audit_record(
                dw,
                &audit_base.record(
                    RunStatus::Success,
                    rows as i64,
                    paths.len() as i64,
                    None,
                    finished_at,
                ),
            )
            .await?;
            info!(%run_id, rows_loaded = rows, parquet_files = paths.len(), "pipeline run succeeded");
            Ok(RunOutcome {
                run_id,
                status: RunStatus::Success,
                rows_loaded: rows,
                parquet_files: paths.len(),
                error: None,
                duration_seconds: seconds_between(started_at, finished_at),
            })
        }
        Err(e) => {
            error!(%run_id, error = %e, "pipeline run failed");
            let finished_at = Utc::now();
            if let Err(audit_err) = write_audit_record(
                dw,
                &audit_base.record(
                    RunStatus::Failure,
                    0,
                    0,
                    Some(e.to_string()),
                    finished_at,
                ),
            )
            .await
            {
                error!(%run_id, error = %audit_err, "failed to write failure audit");
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    registry: &ConnectorRegistry,
    connector_config: &JsonMap,
    query: &str,
    source_name: &str,
    target_table: &str,
    lake_root: &Path,
    dw: &DbEngine,
    dw_schema: Option<&str>,
) -> Result<Execution> {
    let mut connector = registry.create(connector_config)?;
    connector.connect().await?;

    // Close on every exit path out of fetch; a close failure only surfaces
    // when the fetch itself succeeded.
    let fetched = connector.fetch(query).await;
    let closed = connector.close().await;
    let result = fetched?;
    closed?;

    if !result.success {
        let message = result
            .error_message()
            .unwrap_or("unknown ingestion failure")
            .to_string();
        return Ok(Execution::EnvelopeFailure(message));
    }

    let paths = write_ingestion_result(&result, lake_root, source_name)?;
    let rows = load_parquet_files(dw, &paths, target_table, dw_schema).await?;
    Ok(Execution::Loaded { rows, paths })
}

struct AuditBase<'a> {
    run_id: Uuid,
    pipeline_name: &'a str,
    source_name: &'a str,
    protocol: &'a str,
    target_table: &'a str,
    started_at: DateTime<Utc>,
}

impl AuditBase<'_> {
    fn record(
        &self,
        status: RunStatus,
        rows_loaded: i64,
        parquet_files: i64,
        error_message: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> AuditRecord {
        AuditRecord {
            run_id: self.run_id,
            pipeline_name: self.pipeline_name.to_string(),
            source_name: self.source_name.to_string(),
            protocol: self.protocol.to_string(),
            target_table: self.target_table.to_string(),
            status,
            rows_loaded,
            parquet_files,
            error_message,
            started_at: self.started_at,
            finished_at: Some(finished_at),
        }
    }
}

fn seconds_between(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> f64 {
    (finished_at - started_at).num_milliseconds() as f64 / 1000.0
}
