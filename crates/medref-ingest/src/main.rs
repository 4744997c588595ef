//! Medref Ingest - incremental ingestion of medical reference datasets

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use medref_common::logging::{init_logging, LogLevel};
use medref_common::types::SourceType;
use medref_ingest::config::IngestConfig;
use medref_ingest::db::{self, DbConfig};
use medref_ingest::framework::discovery::discover_files;
use medref_ingest::framework::{
    FingerprintStore, IngestionPipeline, MemoryRecordStore, RecordStore, RunReport, SqliteRecordStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "medref-ingest")]
#[command(author, version, about = "Incremental, deduplicating ingestion of medical reference datasets")]
struct Cli {
    /// Configuration file (defaults to ./medref.toml when present)
    #[arg(short, long, env = "MEDREF_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest configured sources
    Run {
        /// Source to ingest; repeat for several, omit for all configured sources
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Reprocess files even when their fingerprint is unchanged
        #[arg(long)]
        force: bool,

        /// Merge records already in the store instead of skipping them
        #[arg(long)]
        refresh: bool,

        /// Parse workers (default: half the available cores)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Deduplicate into memory without writing records
        #[arg(long)]
        dry_run: bool,

        /// Print run reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget file fingerprints so files are processed again
    Reset {
        #[arg(short, long)]
        source: String,

        /// Only this file name
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Delete fingerprints older than the given number of days
    Cleanup {
        #[arg(short, long)]
        days: u32,
    },

    /// Show fingerprint and record counts
    Status {
        #[arg(short, long)]
        source: Option<String>,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = IngestConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = LogLevel::Debug;
    }
    let _log_guard = init_logging(&config.logging)?;
    let pool = db::connect(&config.database)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;

    match cli.command {
        Command::Run {
            sources,
            force,
            refresh,
            workers,
            dry_run,
            json,
        } => {
            let mut pipeline_config = config.pipeline.clone();
            pipeline_config.force_reprocess |= force;
            pipeline_config.refresh_existing |= refresh;
            if let Some(workers) = workers {
                pipeline_config.max_workers = workers;
            }

            // A dry run keeps both records and fingerprints in memory
            let (store, fingerprints): (Arc<dyn RecordStore>, FingerprintStore) = if dry_run {
                warn!("Dry run: records and fingerprints are kept in memory only");
                let scratch = db::connect(&scratch_db_config()).await?;
                (Arc::new(MemoryRecordStore::new()), FingerprintStore::new(scratch))
            } else {
                (
                    Arc::new(SqliteRecordStore::new(pool.clone())),
                    FingerprintStore::new(pool.clone()),
                )
            };

            let names: Vec<String> = if sources.is_empty() {
                config.sources.keys().cloned().collect()
            } else {
                sources
            };
            if names.is_empty() {
                bail!("No sources configured; add a [sources.<name>] section to the config file");
            }

            let mut runs = Vec::with_capacity(names.len());
            for name in &names {
                let source = config.source(name)?;
                let paths = discover_files(&source.directory, &source.extensions)?;
                runs.push((SourceType::new(name.as_str())?, paths));
            }

            let mut pipeline = IngestionPipeline::new(
                config.build_registry()?,
                fingerprints,
                store,
            )
            .with_config(pipeline_config)
            .with_retry_policy(config.retry.clone());

            let bar = config.progress.show_bar.then(files_progress_bar).transpose()?;
            if let Some(bar) = &bar {
                pipeline = pipeline.with_progress_bar(bar.clone());
            }

            let cancel = pipeline.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight files before stopping");
                    cancel.cancel();
                }
            });

            let results = pipeline.run_sources(runs).await;
            if let Some(bar) = &bar {
                bar.finish_and_clear();
            }

            let mut reports: Vec<RunReport> = Vec::with_capacity(results.len());
            for (source_type, result) in results {
                let report =
                    result.with_context(|| format!("Ingestion of '{}' could not start", source_type))?;
                reports.push(report);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    println!("{}", report.summary_line());
                }
            }

            let unsuccessful = reports.iter().filter(|r| !r.is_success()).count();
            if unsuccessful > 0 {
                bail!("{} of {} source runs did not complete", unsuccessful, reports.len());
            }
            info!("Ingestion complete");
        },
        Command::Reset { source, file } => {
            let source_type = SourceType::new(source)?;
            let removed = FingerprintStore::new(pool)
                .reset(&source_type, file.as_deref())
                .await?;
            println!("Removed {} fingerprint(s) for {}", removed, source_type);
        },
        Command::Cleanup { days } => {
            let removed = FingerprintStore::new(pool).cleanup(days).await?;
            println!("Removed {} fingerprint(s) older than {} days", removed, days);
        },
        Command::Status { source, json } => {
            let source_type = source.map(SourceType::new).transpose()?;
            let fingerprints = FingerprintStore::new(pool.clone());
            let records = SqliteRecordStore::new(pool);

            let mut rows = Vec::new();
            for stats in fingerprints.stats(source_type.as_ref()).await? {
                let stored = records.count(&SourceType::new(stats.source_type.as_str())?).await?;
                rows.push(serde_json::json!({
                    "source_type": stats.source_type,
                    "files_tracked": stats.files_tracked,
                    "records_found": stats.records_found,
                    "records_processed": stats.records_processed,
                    "records_stored": stored,
                    "last_processed_at": stats.last_processed_at,
                }));
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No files processed yet");
            } else {
                for row in &rows {
                    println!(
                        "{}: {} files, {} records found, {} processed, {} stored, last run {}",
                        row["source_type"].as_str().unwrap_or_default(),
                        row["files_tracked"],
                        row["records_found"],
                        row["records_processed"],
                        row["records_stored"],
                        row["last_processed_at"].as_str().unwrap_or("never"),
                    );
                }
            }
        },
    }

    Ok(())
}

/// Single-connection in-memory database; every connection would get its own
fn scratch_db_config() -> DbConfig {
    DbConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        idle_timeout_secs: None,
        max_lifetime_secs: None,
        ..Default::default()
    }
}

/// Files progress bar fed by the pipeline
fn files_progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} files")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}
