//! Granary CLI - run ETL pipelines and test connections.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use granary_connectors::{test_dw_connection, ConnectorRegistry};
use granary_core::config::load_connector_config;
use granary_pipeline::run_pipeline;

#[derive(Parser)]
#[command(name = "granary")]
#[command(about = "Single-node ETL: sources to a relational warehouse via Parquet staging")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ETL pipeline
    Run {
        /// Path to the connector JSON/YAML config
        #[arg(long)]
        config: PathBuf,

        /// Query or resource to fetch
        #[arg(long)]
        query: String,

        /// Logical name of the source
        #[arg(long)]
        source: String,

        /// Target DW table name
        #[arg(long)]
        table: String,

        /// Base path for the data lake (Parquet)
        #[arg(long)]
        lake: PathBuf,

        /// Target DW schema
        #[arg(long, default_value = "public")]
        schema: String,

        /// Pipeline name for auditing
        #[arg(long, default_value = "default")]
        pipeline: String,
    },

    /// Test a connection
    TestConnection {
        /// Test the data warehouse connection ("dw")
        #[arg(long)]
        source: Option<String>,

        /// Test a source connection using a config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install tracing subscriber");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Commands::Run {
            config,
            query,
            source,
            table,
            lake,
            schema,
            pipeline,
        } => cmd_run(config, query, source, table, lake, schema, pipeline).await,
        Commands::TestConnection { source, config } => cmd_test_connection(source, config).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    config_path: PathBuf,
    query: String,
    source: String,
    table: String,
    lake: PathBuf,
    schema: String,
    pipeline: String,
) -> ExitCode {
    // Config errors are fatal before the run starts: no audit row.
    let connector_config = match load_connector_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading connector config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(connector_config, query, source, table, lake, schema, pipeline).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Pipeline failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(
    connector_config: granary_core::JsonMap,
    query: String,
    source: String,
    table: String,
    lake: PathBuf,
    schema: String,
    pipeline: String,
) -> Result<ExitCode> {
    let dw = granary_connectors::get_dw_engine(None, true).await?;
    let registry = ConnectorRegistry::with_builtins();

    let outcome = run_pipeline(
        &registry,
        &connector_config,
        &query,
        &source,
        &table,
        &lake,
        &dw,
        Some(&schema),
        &pipeline,
    )
    .await?;

    println!("{}", serde_json::to_string(&outcome)?);
    match outcome.error {
        None => {
            eprintln!(
                "Pipeline finished successfully. Rows loaded: {}",
                outcome.rows_loaded
            );
            Ok(ExitCode::SUCCESS)
        }
        Some(error) => {
            eprintln!("Pipeline failed: {}", error);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cmd_test_connection(source: Option<String>, config: Option<PathBuf>) -> ExitCode {
    let (ok, detail) = match (source.as_deref(), config) {
        (Some("dw"), _) => {
            let ok = test_dw_connection(None).await;
            (ok, "Data Warehouse (PostgreSQL)".to_string())
        }
        (_, Some(config_path)) => match probe_source(&config_path).await {
            Ok(detail) => (true, detail),
            Err(e) => (false, e.to_string()),
        },
        _ => {
            eprintln!("Error: must specify --source dw or --config <path>");
            return ExitCode::from(2);
        }
    };

    println!("{}", json!({"ok": ok, "detail": detail}));
    if ok {
        eprintln!("Connection to {} successful.", detail);
        ExitCode::SUCCESS
    } else {
        eprintln!("Connection test failed: {}", detail);
        ExitCode::FAILURE
    }
}

async fn probe_source(config_path: &PathBuf) -> Result<String> {
    let config = load_connector_config(config_path)?;
    let protocol = config
        .get("protocol")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let registry = ConnectorRegistry::with_builtins();
    let mut connector = registry.create(&config)?;
    connector.connect().await?;
    connector.close().await?;
    info!(protocol = %protocol, "source connection validated");
    Ok(format!("Source ({}) from {}", protocol, config_path.display()))
}
