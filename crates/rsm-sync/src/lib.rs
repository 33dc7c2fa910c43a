//! Pipeline orchestration: ingestion then scoring under a run lock, per-run
//! reports and the optional cron scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rsm_adapters::{FixtureSource, ItemSource, OpenAiScorer, RedditSource, SentimentScorer};
use rsm_storage::{Clock, HttpClientConfig, HttpFetcher, StatusCounts, Store, StoreError, SystemClock};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod ingest;
pub mod lock;
pub mod report;
pub mod scoring;

pub use config::{ConfigError, MinerConfig, SourceKind, SourcesFile};
pub use ingest::{IngestError, IngestionResult, IngestionStage};
pub use lock::{lock_path_for, LockError, RunLock};
pub use report::{channel_breakdown, report_markdown, write_reports, ChannelSentiment};
pub use scoring::{
    CancelSignal, Classifier, ScoringError, ScoringPolicy, ScoringResult, ScoringStage, StopReason,
};

pub const CRATE_NAME: &str = "rsm-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("another run is in progress (lock {})", lock_path.display())]
    AlreadyRunning { lock_path: PathBuf },
    #[error("run lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ingestion failed: {0}")]
    Ingest(#[from] IngestError),
    #[error("scoring failed: {0}")]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("writing reports: {0:#}")]
    Report(anyhow::Error),
}

impl From<LockError> for PipelineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held(lock_path) => Self::AlreadyRunning { lock_path },
            LockError::Io { path, source } => Self::Lock { path, source },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub fetched: u64,
    pub inserted: u64,
    pub pages: u64,
    /// Set when ingestion failed and the run went on to score the backlog.
    pub ingest_error: Option<String>,
    pub scored: u64,
    pub failed: u64,
    pub skipped: u64,
    pub model_calls: u64,
    pub stopped: Option<StopReason>,
    pub last_errors: Vec<String>,
    pub counts: StatusCounts,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    fn start(run_id: Uuid, started_at: DateTime<Utc>, source: &str) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            source: source.to_string(),
            fetched: 0,
            inserted: 0,
            pages: 0,
            ingest_error: None,
            scored: 0,
            failed: 0,
            skipped: 0,
            model_calls: 0,
            stopped: None,
            last_errors: Vec::new(),
            counts: StatusCounts::default(),
            reports_dir: None,
        }
    }
}

/// What `clear` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    Scores,
    All,
}

pub struct Pipeline {
    config: MinerConfig,
    store: Store,
    source: Arc<dyn ItemSource>,
    scorer: Arc<dyn SentimentScorer>,
    clock: Arc<dyn Clock>,
    cancel: CancelSignal,
}

impl Pipeline {
    pub fn new(
        config: MinerConfig,
        store: Store,
        source: Arc<dyn ItemSource>,
        scorer: Arc<dyn SentimentScorer>,
    ) -> Self {
        Self {
            config,
            store,
            source,
            scorer,
            clock: Arc::new(SystemClock),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wire the configured source, the OpenAI scorer and the SQLite store.
    pub async fn from_config(config: MinerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            user_agent: Some(config.reddit.user_agent.clone()),
            ..Default::default()
        })?);

        let source: Arc<dyn ItemSource> = match config.source {
            SourceKind::Reddit => {
                let sources = SourcesFile::load(&config.sources_file)?;
                Arc::new(RedditSource::new(
                    config.reddit_config(&sources)?,
                    Arc::clone(&http),
                ))
            }
            SourceKind::Fixture => Arc::new(FixtureSource::new(
                config.fixture_path.clone(),
                config.page_size,
            )),
        };
        let scorer = Arc::new(OpenAiScorer::new(config.openai_config()?, http));
        let store = open_store(&config.database_path).await?;
        Ok(Self::new(config, store, source, scorer))
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Cancelling stops the scoring stage of the current and any later run.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let _lock = RunLock::acquire(&self.config.lock_path)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, source = self.source.source_id());
        async {
            let mut summary = RunSummary::start(run_id, self.clock.wall(), self.source.source_id());

            match self.ingestion().run(self.source.as_ref()).await {
                Ok(ingested) => {
                    summary.fetched = ingested.fetched;
                    summary.inserted = ingested.inserted;
                    summary.pages = ingested.pages;
                }
                Err(err) if self.config.continue_on_ingest_error => {
                    warn!(error = %err, "ingestion failed; scoring the existing backlog");
                    summary.ingest_error = Some(err.to_string());
                }
                Err(err) => return Err(err.into()),
            }

            let scored = self.scoring().run(Arc::clone(&self.scorer)).await?;
            summary.scored = scored.scored;
            summary.failed = scored.failed;
            summary.skipped = scored.skipped;
            summary.model_calls = scored.model_calls;
            summary.stopped = scored.stopped;
            summary.last_errors = scored.last_errors;
            summary.counts = self.store.status_counts().await?;
            summary.finished_at = self.clock.wall();

            if let Some(root) = &self.config.reports_dir {
                summary.reports_dir = Some(root.join(run_id.to_string()).display().to_string());
                write_reports(root, &summary, &self.store)
                    .await
                    .map_err(PipelineError::Report)?;
            }

            info!(
                fetched = summary.fetched,
                inserted = summary.inserted,
                scored = summary.scored,
                failed = summary.failed,
                pending = summary.counts.pending,
                "run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Ingestion only, under the run lock.
    pub async fn ingest_once(&self) -> Result<IngestionResult, PipelineError> {
        let _lock = RunLock::acquire(&self.config.lock_path)?;
        Ok(self.ingestion().run(self.source.as_ref()).await?)
    }

    /// Scoring only, under the run lock.
    pub async fn score_once(&self) -> Result<ScoringResult, PipelineError> {
        let _lock = RunLock::acquire(&self.config.lock_path)?;
        Ok(self.scoring().run(Arc::clone(&self.scorer)).await?)
    }

    /// Registers `run_once` on both cron expressions. A tick that finds
    /// another run in progress is skipped.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move { pipeline.scheduled_run().await })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }

    async fn scheduled_run(&self) {
        match self.run_once().await {
            Ok(summary) => info!(
                run_id = %summary.run_id,
                scored = summary.scored,
                failed = summary.failed,
                "scheduled run finished"
            ),
            Err(PipelineError::AlreadyRunning { lock_path }) => warn!(
                lock = %lock_path.display(),
                "scheduled run skipped; another run holds the lock"
            ),
            Err(err) => error!(error = %err, "scheduled run failed"),
        }
    }

    fn ingestion(&self) -> IngestionStage {
        IngestionStage::new(self.store.clone(), Arc::clone(&self.clock))
            .with_max_pages(self.config.max_pages)
    }

    fn scoring(&self) -> ScoringStage {
        ScoringStage::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            self.config.scoring.clone(),
        )
        .with_cancel(self.cancel.clone())
    }
}

async fn open_store(path: &Path) -> anyhow::Result<Store> {
    Store::open(path)
        .await
        .with_context(|| format!("opening database {}", path.display()))
}

/// Put failed records back in the queue, bounded by `max_reenables`.
pub async fn requeue_failed(config: &MinerConfig) -> anyhow::Result<u64> {
    let _lock = RunLock::acquire(&config.lock_path).map_err(PipelineError::from)?;
    let store = open_store(&config.database_path).await?;
    let requeued = store
        .reenable_failed(config.scoring.max_reenables, Utc::now())
        .await?;
    info!(requeued, "failed records re-enabled");
    Ok(requeued)
}

pub async fn clear(config: &MinerConfig, scope: ClearScope) -> anyhow::Result<()> {
    let _lock = RunLock::acquire(&config.lock_path).map_err(PipelineError::from)?;
    let store = open_store(&config.database_path).await?;
    match scope {
        ClearScope::Scores => {
            let scores = store.clear_scores().await?;
            info!(scores, "score records cleared");
        }
        ClearScope::All => {
            let (scores, items) = store.clear_all().await?;
            info!(scores, items, "items, scores and cursor cleared");
        }
    }
    Ok(())
}

pub async fn run_once_from_env() -> anyhow::Result<RunSummary> {
    let config = MinerConfig::from_env()?;
    let pipeline = Pipeline::from_config(config).await?;
    Ok(pipeline.run_once().await?)
}
