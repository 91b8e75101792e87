use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use hrep_core::{parse_run_date, RunSummary};
use hrep_sync::{
    append_step_summary, load_snapshots, to_ci_annotations, write_summary_json, RunRequest,
    SyncConfig, SyncPipeline,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hrep")]
#[command(about = "Hotel reputation tracker command-line interface")]
struct Cli {
    /// Run configuration (overrides HREP_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the per-site score tables (overrides HREP_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    fixtures_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect every configured site (or `--sites`) and commit the scores.
    Run {
        #[arg(long, value_delimiter = ',')]
        sites: Vec<String>,
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        #[arg(long)]
        summary_out: Option<PathBuf>,
        /// Write a batch snapshot for a later `merge` instead of committing.
        #[arg(long, conflicts_with = "merge")]
        batch_out: Option<PathBuf>,
        /// Batch snapshots produced elsewhere, merged into this run.
        #[arg(long, value_delimiter = ',')]
        merge: Vec<PathBuf>,
    },
    /// Merge and commit batch snapshots produced elsewhere.
    Merge {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        summary_out: Option<PathBuf>,
    },
    /// Check that every site table has a column for the run date.
    Verify {
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        #[arg(long)]
        summary_out: Option<PathBuf>,
    },
    /// Run on HREP_SYNC_CRON until interrupted.
    Schedule,
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    parse_run_date(raw).ok_or_else(|| format!("`{raw}` is not a YYYY-MM-DD date"))
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hrep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.config {
        config.config_path = path;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.fixtures_dir {
        config.fixtures_dir = dir;
    }

    let command = cli.command.unwrap_or(Commands::Run {
        sites: Vec::new(),
        date: None,
        summary_out: None,
        batch_out: None,
        merge: Vec::new(),
    });

    match command {
        Commands::Run {
            sites,
            date,
            summary_out,
            batch_out,
            merge,
        } => {
            let pipeline = SyncPipeline::load(config).await?;
            let run_date = date.unwrap_or_else(today);
            let sites = (!sites.is_empty()).then_some(sites);

            let summary = match batch_out {
                Some(path) => {
                    let batch = pipeline.run_to_batch(sites.as_deref(), run_date).await?;
                    batch
                        .write(&path)
                        .with_context(|| format!("writing batch snapshot {}", path.display()))?;
                    batch.summary
                }
                None => {
                    let request = RunRequest {
                        sites,
                        run_date,
                        merge,
                    };
                    pipeline.run_weekly(&request).await?
                }
            };
            emit(&summary, summary_out.as_deref())
        }
        Commands::Merge { paths, summary_out } => {
            let pipeline = SyncPipeline::load(config).await?;
            let batches = load_snapshots(&paths)?;
            let summary = pipeline.merge_and_commit(batches)?;
            emit(&summary, summary_out.as_deref())
        }
        Commands::Verify { date, summary_out } => {
            let pipeline = SyncPipeline::load(config).await?;
            let summary = pipeline.verify(date.unwrap_or_else(today))?;
            emit(&summary, summary_out.as_deref())
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = SyncPipeline::load(config).await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(ExitCode::SUCCESS);
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Annotations on stdout, optional JSON summary file, workflow step summary.
fn emit(summary: &RunSummary, summary_out: Option<&Path>) -> Result<ExitCode> {
    for annotation in to_ci_annotations(summary) {
        println!("{annotation}");
    }
    if let Some(path) = summary_out {
        write_summary_json(summary, path)?;
    }
    append_step_summary(summary)?;
    info!(
        run_date = %summary.run_date(),
        status = %summary.overall_status(),
        "run finished"
    );
    Ok(ExitCode::from(summary.exit_code()))
}
