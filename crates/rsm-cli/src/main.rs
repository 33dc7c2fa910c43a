use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use rsm_storage::Store;
use rsm_sync::{clear, report_markdown, requeue_failed, ClearScope, MinerConfig, Pipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rsm")]
#[command(about = "Reddit Sentiment Miner: ingest comments, score sentiment, report")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest new items, then score the backlog
    Run,
    /// Ingestion only
    Ingest,
    /// Scoring only
    Score,
    /// Per-channel sentiment over scored items
    Report(ReportArgs),
    /// Re-enable failed records for another round of attempts
    Requeue,
    /// Delete stored state
    Clear(ClearArgs),
    /// Run on the configured cron schedule until Ctrl-C
    Schedule,
}

#[derive(Debug, Args)]
struct ReportArgs {
    /// Inclusive lower bound on fetch time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_when)]
    since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on fetch time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_when)]
    until: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 10)]
    top: usize,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct ClearArgs {
    /// Drop score records only
    #[arg(long)]
    scores: bool,
    /// Drop items, scores and the cursor
    #[arg(long)]
    all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rsm=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = MinerConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = Pipeline::from_config(config).await?;
            cancel_on_ctrl_c(&pipeline);
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} fetched={} new={} scored={} failed={} skipped={} reports={}",
                summary.run_id,
                summary.fetched,
                summary.inserted,
                summary.scored,
                summary.failed,
                summary.skipped,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
            if let Some(err) = &summary.ingest_error {
                eprintln!("ingestion failed: {err}");
            }
        }
        Commands::Ingest => {
            let pipeline = Pipeline::from_config(config).await?;
            let result = pipeline.ingest_once().await?;
            println!(
                "ingest complete: fetched={} new={} pages={}",
                result.fetched, result.inserted, result.pages
            );
        }
        Commands::Score => {
            let pipeline = Pipeline::from_config(config).await?;
            cancel_on_ctrl_c(&pipeline);
            let result = pipeline.score_once().await?;
            println!(
                "score complete: scored={} failed={} skipped={} model_calls={}",
                result.scored, result.failed, result.skipped, result.model_calls
            );
            if let Some(stopped) = &result.stopped {
                eprintln!("scoring stopped early: {stopped:?}");
            }
        }
        Commands::Report(args) => {
            let store = Store::open(&config.database_path)
                .await
                .with_context(|| format!("opening database {}", config.database_path.display()))?;
            print!(
                "{}",
                report_markdown(&store, args.since, args.until, args.top).await?
            );
        }
        Commands::Requeue => {
            let requeued = requeue_failed(&config).await?;
            println!("requeued {requeued} failed records");
        }
        Commands::Clear(args) => {
            let scope = if args.all {
                ClearScope::All
            } else {
                ClearScope::Scores
            };
            clear(&config, scope).await?;
            println!("cleared {scope:?}");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set RSM_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            pipeline.cancel_signal().cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

/// First Ctrl-C stops scoring after in-flight calls are dropped and their claims released.
fn cancel_on_ctrl_c(pipeline: &Pipeline) {
    let cancel = pipeline.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping scoring");
            cancel.cancel();
        }
    });
}

fn parse_when(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("expected RFC 3339 or YYYY-MM-DD, got {raw:?}"))
}
