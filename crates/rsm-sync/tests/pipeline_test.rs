use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rsm_adapters::{order_snapshot, paginate, ItemSource, SentimentScorer};
use rsm_core::{
    Cursor, RawItem, ScoreError, ScoreStatus, Sentiment, SentimentLabel, SourceError, SourcePage,
};
use rsm_storage::{ManualClock, Store};
use rsm_sync::{
    clear, requeue_failed, ClearScope, MinerConfig, Pipeline, PipelineError, RunLock,
};
use tempfile::{tempdir, TempDir};

fn ts(min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 14, min, 0).single().expect("ts")
}

fn raw(id: &str, min: u32, text: &str) -> RawItem {
    RawItem {
        id: id.into(),
        source_id: "memory".into(),
        source_created_at: ts(min),
        text: text.into(),
        fetched_at: ts(50),
        channel: Some("stocks".into()),
        author: Some("trader".into()),
        parent_title: None,
    }
}

/// A at :01, B at :02, C at :03; A and C bullish, B bearish.
fn abc() -> Vec<RawItem> {
    vec![
        raw("t1_a", 1, "NVDA to the moon"),
        raw("t1_b", 2, "this will dump hard"),
        raw("t1_c", 3, "moon soon, adding calls"),
    ]
}

struct MemorySource {
    items: Vec<RawItem>,
    down: AtomicBool,
}

impl MemorySource {
    fn new(items: Vec<RawItem>) -> Self {
        Self {
            items,
            down: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ItemSource for MemorySource {
    fn source_id(&self) -> &str {
        "memory"
    }

    async fn fetch_page(
        &self,
        _cursor: &Cursor,
        page_token: Option<&str>,
    ) -> Result<SourcePage, SourceError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("503 from listing".into()));
        }
        let snapshot = order_snapshot(self.items.clone());
        paginate(&snapshot, page_token, 2)
    }
}

/// Keyword scorer: "moon" is positive, "dump" negative, "garbage" unparseable.
#[derive(Default)]
struct KeywordScorer {
    calls: AtomicUsize,
}

#[async_trait]
impl SentimentScorer for KeywordScorer {
    fn model(&self) -> Option<&str> {
        Some("keyword-v1")
    }

    async fn score(&self, text: &str) -> Result<Sentiment, ScoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let label = if text.contains("garbage") {
            return Err(ScoreError::Permanent("model returned prose".into()));
        } else if text.contains("moon") {
            SentimentLabel::Positive
        } else if text.contains("dump") {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        };
        Ok(Sentiment::new(label, 0.9).expect("confidence in range"))
    }
}

struct Harness {
    dir: TempDir,
    config: MinerConfig,
    source: Arc<MemorySource>,
    scorer: Arc<KeywordScorer>,
}

impl Harness {
    fn new(items: Vec<RawItem>, extra: &[(&str, &str)]) -> Self {
        let dir = tempdir().expect("tempdir");
        let mut vars: HashMap<String, String> = HashMap::from([
            (
                "RSM_DATABASE_PATH".to_string(),
                dir.path().join("rsm.db").display().to_string(),
            ),
            ("RSM_REPORTS_DIR".to_string(), String::new()),
            ("RSM_SOURCE".to_string(), "fixture".to_string()),
        ]);
        for (key, value) in extra {
            vars.insert(key.to_string(), value.to_string());
        }
        let config = MinerConfig::from_lookup(|key| vars.get(key).cloned()).expect("config");
        Self {
            dir,
            config,
            source: Arc::new(MemorySource::new(items)),
            scorer: Arc::new(KeywordScorer::default()),
        }
    }

    async fn pipeline(&self) -> Pipeline {
        let store = Store::open(&self.config.database_path).await.expect("store");
        Pipeline::new(
            self.config.clone(),
            store,
            self.source.clone(),
            self.scorer.clone(),
        )
        .with_clock(Arc::new(ManualClock::new(ts(55))))
    }

    fn calls(&self) -> usize {
        self.scorer.calls.load(Ordering::SeqCst)
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.dir.path().join(rel)
    }
}

async fn label_of(store: &Store, id: &str) -> Option<SentimentLabel> {
    store
        .get_score(id)
        .await
        .unwrap()
        .and_then(|record| record.sentiment)
        .map(|sentiment| sentiment.label)
}

#[tokio::test]
async fn end_to_end_run_scores_every_item_and_advances_cursor() {
    let harness = Harness::new(abc(), &[]);
    let pipeline = harness.pipeline().await;

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!((summary.fetched, summary.inserted, summary.pages), (3, 3, 2));
    assert_eq!((summary.scored, summary.failed), (3, 0));
    assert_eq!(summary.counts.scored, 3);
    assert!(summary.reports_dir.is_none());

    let store = pipeline.store();
    assert_eq!(store.item_count().await.unwrap(), 3);
    assert_eq!(label_of(store, "t1_a").await, Some(SentimentLabel::Positive));
    assert_eq!(label_of(store, "t1_b").await, Some(SentimentLabel::Negative));
    assert_eq!(label_of(store, "t1_c").await, Some(SentimentLabel::Positive));
    assert_eq!(store.get_cursor().await.unwrap().watermark, Some(ts(3)));
    let record = store.get_score("t1_a").await.unwrap().unwrap();
    assert_eq!(record.model.as_deref(), Some("keyword-v1"));
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn repeated_runs_add_nothing_and_never_rescore() {
    let harness = Harness::new(abc(), &[]);
    let pipeline = harness.pipeline().await;

    pipeline.run_once().await.unwrap();
    let cursor = pipeline.store().get_cursor().await.unwrap();
    assert_eq!(harness.calls(), 3);

    let second = pipeline.run_once().await.unwrap();
    assert_eq!((second.inserted, second.scored, second.model_calls), (0, 0, 0));
    assert_eq!(harness.calls(), 3);
    assert_eq!(pipeline.store().item_count().await.unwrap(), 3);
    assert_eq!(pipeline.store().get_cursor().await.unwrap(), cursor);
}

#[tokio::test]
async fn page_committed_without_cursor_is_refetched_without_duplicates() {
    let harness = Harness::new(abc(), &[]);
    let pipeline = harness.pipeline().await;
    // first page landed, process died before the final page moved the cursor
    let items = abc();
    pipeline.store().put_items(&items[..2]).await.unwrap();
    assert_eq!(pipeline.store().get_cursor().await.unwrap(), Cursor::default());

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!((summary.fetched, summary.inserted), (3, 1));
    assert_eq!(summary.scored, 3);
    assert_eq!(pipeline.store().item_count().await.unwrap(), 3);
    assert_eq!(
        pipeline.store().get_cursor().await.unwrap().watermark,
        Some(ts(3))
    );
}

#[tokio::test]
async fn held_lock_rejects_the_run_before_any_state_change() {
    let harness = Harness::new(abc(), &[]);
    let pipeline = harness.pipeline().await;
    let _held = RunLock::acquire(&harness.config.lock_path).unwrap();

    let err = pipeline.run_once().await.unwrap_err();
    assert!(
        matches!(&err, PipelineError::AlreadyRunning { lock_path } if *lock_path == harness.config.lock_path)
    );
    assert!(matches!(
        pipeline.score_once().await,
        Err(PipelineError::AlreadyRunning { .. })
    ));
    assert_eq!(pipeline.store().item_count().await.unwrap(), 0);
    assert_eq!(pipeline.store().get_cursor().await.unwrap(), Cursor::default());
    assert_eq!(harness.calls(), 0);
}

#[tokio::test]
async fn ingestion_failure_aborts_unless_backlog_scoring_is_enabled() {
    let backlog = raw("t1_old", 0, "moon mission");

    let strict = Harness::new(abc(), &[]);
    strict.source.down.store(true, Ordering::SeqCst);
    let pipeline = strict.pipeline().await;
    pipeline.store().put_items(&[backlog.clone()]).await.unwrap();
    let err = pipeline.run_once().await.unwrap_err();
    assert!(matches!(err, PipelineError::Ingest(_)));
    assert!(pipeline.store().get_score("t1_old").await.unwrap().is_none());

    let lenient = Harness::new(abc(), &[("RSM_CONTINUE_ON_INGEST_ERROR", "true")]);
    lenient.source.down.store(true, Ordering::SeqCst);
    let pipeline = lenient.pipeline().await;
    pipeline.store().put_items(&[backlog]).await.unwrap();
    let summary = pipeline.run_once().await.unwrap();
    assert!(summary
        .ingest_error
        .as_deref()
        .is_some_and(|err| err.contains("503")));
    assert_eq!(summary.scored, 1);
    assert_eq!(
        label_of(pipeline.store(), "t1_old").await,
        Some(SentimentLabel::Positive)
    );
}

#[tokio::test]
async fn run_writes_summary_and_snapshots_under_run_id() {
    let harness = Harness::new(abc(), &[]);
    let reports = harness.path("reports");
    let harness = Harness {
        config: MinerConfig {
            reports_dir: Some(reports.clone()),
            ..harness.config.clone()
        },
        ..harness
    };
    let pipeline = harness.pipeline().await;

    let summary = pipeline.run_once().await.unwrap();
    let dir = reports.join(summary.run_id.to_string());
    assert_eq!(summary.reports_dir.as_deref(), Some(dir.display().to_string().as_str()));

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join("run_summary.json")).unwrap()).unwrap();
    assert_eq!(json["scored"], 3);
    assert_eq!(json["counts"]["scored"], 3);
    for file in ["run_summary.md", "snapshots/sentiment.parquet", "snapshots/channels.parquet"] {
        assert!(dir.join(file).exists(), "{file} missing");
    }
    assert!(dir.join("snapshots/manifest.json").exists());
}

#[tokio::test]
async fn failed_records_can_be_requeued_and_state_cleared() {
    let mut items = abc();
    items.push(raw("t1_d", 4, "garbage in"));
    let harness = Harness::new(items, &[]);
    let pipeline = harness.pipeline().await;

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!((summary.scored, summary.failed), (3, 1));
    assert_eq!(summary.last_errors.len(), 1);
    let failed = pipeline.store().get_score("t1_d").await.unwrap().unwrap();
    assert_eq!(failed.status, ScoreStatus::Failed);
    assert!(failed.permanent);

    assert_eq!(requeue_failed(&harness.config).await.unwrap(), 1);
    let requeued = pipeline.store().get_score("t1_d").await.unwrap().unwrap();
    assert_eq!((requeued.status, requeued.attempts), (ScoreStatus::Pending, 0));

    clear(&harness.config, ClearScope::Scores).await.unwrap();
    assert_eq!(pipeline.store().status_counts().await.unwrap().scored, 0);
    assert_eq!(pipeline.store().item_count().await.unwrap(), 4);

    clear(&harness.config, ClearScope::All).await.unwrap();
    assert_eq!(pipeline.store().item_count().await.unwrap(), 0);
    assert_eq!(pipeline.store().get_cursor().await.unwrap(), Cursor::default());
}
