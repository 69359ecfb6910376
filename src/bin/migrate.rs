//! Rollup Migrate Binary
//!
//! Migrates legacy per-bucket aggregate tables into the aggregate table.
//! Exits with status 0 once every bucket is done and 2 on any error,
//! including a run that ended with work left over; run it again to resume.

use rollup_migrator::config::{parse_buckets, ComponentFactory, MigrationConfig};
use rollup_migrator::migration::{AggregateMigrator, KeySource};
use rollup_migrator::store::StorageSession;
use rollup_migrator::telemetry::Telemetry;

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeySourceArg {
    /// All numeric measurement schedules from the catalog
    Catalog,
    /// Schedules found in each bucket's legacy index
    Index,
}

/// Rollup Migrate
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON fixture seeding the local store
    #[arg(long, env = "STORE_FIXTURE")]
    fixture: Option<PathBuf>,

    /// Directory of the per-bucket migration logs
    #[arg(long, env = "MIGRATION_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Where candidate schedules come from
    #[arg(long, value_enum, default_value = "catalog")]
    key_source: KeySourceArg,

    /// Buckets to migrate, comma separated (default: all)
    #[arg(long)]
    buckets: Option<String>,

    /// Migrate buckets concurrently
    #[arg(long)]
    concurrent_buckets: bool,

    /// Keep the legacy tables after a complete run
    #[arg(long)]
    keep_legacy_tables: bool,

    /// Stop after this many seconds; the next run resumes
    #[arg(long)]
    max_run_secs: Option<u64>,

    /// Write the aggregate table to this JSON file after the run
    #[arg(long)]
    output: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _telemetry = match Telemetry::init_for_component("rollup-migrate", &args.log_level) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("failed to initialize telemetry: {e}");
            return ExitCode::from(2);
        }
    };

    tokio::select! {
        result = run(args) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Migration failed");
                ExitCode::from(2)
            }
        },
        _ = shutdown_signal() => {
            warn!("Interrupted; completed schedules are logged and the next run resumes");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = MigrationConfig::from_env()?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(raw) = args.buckets.as_deref() {
        config.buckets = parse_buckets(raw)?;
    }
    if args.concurrent_buckets {
        config.concurrent_buckets = true;
    }
    if args.keep_legacy_tables {
        config.drop_legacy_tables = false;
    }
    if let Some(secs) = args.max_run_secs {
        config.max_run_duration = Some(Duration::from_secs(secs));
    }

    let components = ComponentFactory::create_local(args.fixture.as_deref())?;
    let session: Arc<dyn StorageSession> = components.session.clone();
    let key_source = match args.key_source {
        KeySourceArg::Catalog => KeySource::Catalog(components.catalog.clone()),
        KeySourceArg::Index => KeySource::IndexScan,
    };

    info!(
        data_dir = %config.data_dir.display(),
        key_source = ?args.key_source,
        "Starting Rollup Migrate"
    );
    let migrator = AggregateMigrator::new(session, key_source, config)?;
    let report = migrator.run().await?;

    for bucket in &report.buckets {
        info!(
            bucket = %bucket.bucket,
            candidates = bucket.candidates,
            migrated = bucket.migrated,
            already_migrated = bucket.already_migrated,
            records_written = bucket.records_written,
            "Bucket complete"
        );
    }

    if let Some(path) = args.output {
        let aggregates = components.session.all_aggregates();
        let json = serde_json::to_vec_pretty(&aggregates)?;
        tokio::fs::write(&path, json).await?;
        info!(path = %path.display(), records = aggregates.len(), "Wrote aggregate table");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
