//! ETL binary - refreshes lookup tables and incrementally loads homicide facts
//!
//! Usage:
//!   # Create/upgrade the warehouse schema:
//!   cargo run --bin etl -- migrate
//!
//!   # Scheduled run (dimensions + incremental fact load):
//!   cargo run --bin etl -- run
//!
//!   # Load a local CSV snapshot instead of the API, without writing:
//!   cargo run --bin etl -- run --from-file data/HOMICIDIO_20251014.csv --dry-run
//!
//!   # Inspect state / export the fact table for the dashboard:
//!   cargo run --bin etl -- watermark
//!   cargo run --bin etl -- runs --limit 5
//!   cargo run --bin etl -- export --out data/homicidios.csv

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use etl::config::Config;
use etl::dimensions::{DimensionRefresh, RefreshSummary};
use etl::extract::{CsvSnapshotSource, SocrataClient, Source};
use etl::pipeline::{IncrementalLoader, LoadOutcome, LoadReport, LoaderSettings};
use etl::warehouse::{RunStatus, Warehouse};
use etl::watermark::WatermarkStore;
use etl::EtlError;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Loads open-data homicide records into the warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh dimensions, then load facts newer than the watermark
    Run {
        /// Fetch, normalize and filter only - write nothing
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Skip the department/municipality refresh
        #[arg(long, default_value = "false")]
        skip_dimensions: bool,

        /// Read facts from a local CSV snapshot instead of the API
        #[arg(long)]
        from_file: Option<PathBuf>,
    },

    /// Apply database migrations
    Migrate,

    /// Show the current watermark for a process
    Watermark {
        /// Process name (defaults to PROCESS_NAME)
        #[arg(long)]
        process: Option<String>,
    },

    /// List recent runs
    Runs {
        #[arg(long, default_value = "10")]
        limit: i64,
    },

    /// Export the fact table to CSV
    Export {
        #[arg(long)]
        out: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn run(
    config: &Config,
    warehouse: &Warehouse,
    dry_run: bool,
    skip_dimensions: bool,
    from_file: Option<PathBuf>,
) -> Result<()> {
    let api = SocrataClient::new(config.http_timeout, config.page_size, config.app_token.clone())?;
    let snapshot = from_file.map(CsvSnapshotSource::new);
    let fact_source: &dyn Source = match &snapshot {
        Some(csv) => csv,
        None => &api,
    };

    let run_id = if !dry_run {
        Some(warehouse.start_run(&config.process_name).await?)
    } else {
        None
    };

    let result = async {
        let dimensions = if skip_dimensions || dry_run {
            tracing::info!("skipping dimension refresh");
            None
        } else {
            Some(
                DimensionRefresh::new(
                    &api,
                    warehouse,
                    &config.departments_url,
                    &config.municipalities_url,
                )
                .run()
                .await?,
            )
        };

        let loader = IncrementalLoader::new(
            fact_source,
            warehouse,
            warehouse,
            LoaderSettings {
                process_name: config.process_name.clone(),
                source_tag: config.source_tag.clone(),
                dataset_url: config.homicides_url.clone(),
                dry_run,
            },
        );
        let report = loader.run().await?;
        Ok::<_, EtlError>((dimensions, report))
    }
    .await;

    if let Some(run_id) = run_id {
        record_run(warehouse, run_id, &result).await;
    }

    let (_, report) = result.context("ETL run failed")?;

    println!("\n=== ETL Summary ===");
    println!("Process: {}", config.process_name);
    println!("Fetched: {}", report.fetched);
    println!("Normalized: {}", report.normalized);
    match report.outcome {
        LoadOutcome::Loaded { rows, watermark, .. } => {
            println!("Loaded: {rows} rows, watermark now {watermark}");
        }
        LoadOutcome::UpToDate { watermark } => match watermark {
            Some(w) => println!("Up to date (watermark {w})"),
            None => println!("Up to date (no data)"),
        },
        LoadOutcome::DryRun { rows, watermark, .. } => {
            println!("Dry run: would load {rows} rows and advance watermark to {watermark}");
        }
    }

    Ok(())
}

type RunResult = std::result::Result<(Option<RefreshSummary>, LoadReport), EtlError>;

/// Closes the audit row for `run_id`. An audit write failure is logged and
/// never replaces the run's own result.
async fn record_run(warehouse: &Warehouse, run_id: Uuid, result: &RunResult) {
    let (status, detail, error) = match result {
        Ok((dimensions, report)) => {
            let status = match report.outcome {
                LoadOutcome::Loaded { .. } => RunStatus::Ok,
                LoadOutcome::UpToDate { .. } => RunStatus::Noop,
                LoadOutcome::DryRun { .. } => RunStatus::DryRun,
            };
            let detail = serde_json::json!({
                "load": report,
                "departments": dimensions.as_ref().and_then(|d| d.departments),
                "municipalities": dimensions.as_ref().and_then(|d| d.municipalities),
            });
            (status, detail, None)
        }
        Err(e) => (
            RunStatus::Failed,
            serde_json::json!({ "stage": e.stage() }),
            Some(e.to_string()),
        ),
    };

    if let Err(e) = warehouse.finish_run(run_id, status, detail, error.as_deref()).await {
        tracing::error!(%run_id, error = %e, "failed to record run audit");
    }
}

/// Runs one subcommand. Errors return here so `main` still closes the pool.
async fn dispatch(command: Command, config: &Config, warehouse: &Warehouse) -> Result<()> {
    match command {
        Command::Run {
            dry_run,
            skip_dimensions,
            from_file,
        } => run(config, warehouse, dry_run, skip_dimensions, from_file).await,
        Command::Migrate => warehouse.migrate().await.map_err(Into::into),
        Command::Watermark { process } => {
            let process = process.unwrap_or_else(|| config.process_name.clone());
            match warehouse.read(&process).await? {
                Some(date) => println!("{process}: {date}"),
                None => println!("{process}: never loaded"),
            }
            Ok(())
        }
        Command::Runs { limit } => {
            for run in warehouse.recent_runs(limit).await? {
                println!(
                    "{} {} {:<8} {} {}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.run_id,
                    run.status,
                    run.process_name,
                    run.error.unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Export { out } => {
            let rows = warehouse.export_facts_csv(&out).await?;
            println!("Exported {rows} rows to {}", out.display());
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let warehouse = Warehouse::connect(&config)
        .await
        .context("Failed to connect to database")?;

    let result = dispatch(cli.command, &config, &warehouse).await;

    warehouse.close().await;
    result
}
