//! Scoring stage: claim unscored items, call the scorer under pacing and
//! record each outcome.

use std::collections::VecDeque;
use std::future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rsm_adapters::SentimentScorer;
use rsm_core::{Disposition, ScoreError, Sentiment};
use rsm_storage::{
    BackoffPolicy, Clock, ScoreCandidate, Store, StoreError, TokenBucket, TokenBucketConfig,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

/// Number of recent error messages carried on a [`ScoringResult`].
const LAST_ERRORS_KEPT: usize = 10;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("scoring worker panicked: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct ScoringPolicy {
    pub max_attempts: u32,
    pub max_reenables: u32,
    /// Put `failed` records back to `pending` before selecting candidates.
    pub retry_failed: bool,
    /// `None` disables pacing.
    pub rate: Option<TokenBucketConfig>,
    pub concurrency: usize,
    pub run_deadline: Option<Duration>,
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Stage-wide pause after a rate limit that carried no retry hint.
    pub rate_limit_cooldown: Duration,
    /// Upper bound on any single stage-wide pause, hinted or not.
    pub max_rate_limit_pause: Duration,
    pub limit: usize,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_reenables: 2,
            retry_failed: false,
            rate: None,
            concurrency: 1,
            run_deadline: None,
            call_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            rate_limit_cooldown: Duration::from_secs(20),
            max_rate_limit_pause: Duration::from_secs(300),
            limit: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    Deadline,
    Cancelled,
    Aborted(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoringResult {
    pub scored: u64,
    pub failed: u64,
    /// Selected items left unprocessed: lost claims, or a stop before their turn.
    pub skipped: u64,
    pub model_calls: u64,
    pub stopped: Option<StopReason>,
    pub last_errors: Vec<String>,
}

impl ScoringResult {
    fn note_error(&mut self, item_id: &str, error: &str) {
        if self.last_errors.len() == LAST_ERRORS_KEPT {
            self.last_errors.remove(0);
        }
        self.last_errors.push(format!("{item_id}: {error}"));
    }
}

/// Cooperative cancellation shared between the CLI's signal handler and the stage.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

pub type Classifier = Arc<dyn Fn(&ScoreError) -> Disposition + Send + Sync>;

pub struct ScoringStage {
    store: Store,
    clock: Arc<dyn Clock>,
    policy: ScoringPolicy,
    classifier: Option<Classifier>,
    cancel: CancelSignal,
}

impl ScoringStage {
    pub fn new(store: Store, clock: Arc<dyn Clock>, policy: ScoringPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            classifier: None,
            cancel: CancelSignal::new(),
        }
    }

    /// Replace the scorer's own error classification.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&ScoreError) -> Disposition + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(
        &self,
        scorer: Arc<dyn SentimentScorer>,
    ) -> Result<ScoringResult, ScoringError> {
        let span = info_span!("score", model = scorer.model().unwrap_or("unknown"));
        async {
            let now = self.clock.wall();
            let released = self.store.release_stale_claims(now).await?;
            if released > 0 {
                warn!(released, "released claims left over from an interrupted run");
            }
            let seeded = self.store.seed_pending(now).await?;
            let reenabled = if self.policy.retry_failed {
                self.store
                    .reenable_failed(self.policy.max_reenables, now)
                    .await?
            } else {
                0
            };
            let candidates = self
                .store
                .select_candidates(self.policy.max_attempts, self.policy.limit)
                .await?;
            info!(
                seeded,
                reenabled,
                candidates = candidates.len(),
                "scoring started"
            );

            let shared = Arc::new(Worker {
                store: self.store.clone(),
                clock: Arc::clone(&self.clock),
                policy: self.policy.clone(),
                classifier: self.classifier.clone(),
                scorer,
                bucket: self
                    .policy
                    .rate
                    .map(|rate| TokenBucket::new(rate, Arc::clone(&self.clock))),
                cancel: self.cancel.clone(),
                deadline: self.policy.run_deadline.map(|d| self.clock.now() + d),
                queue: Mutex::new(candidates.into()),
                pause_until: Mutex::new(None),
                stop: Mutex::new(None),
                tally: Mutex::new(ScoringResult::default()),
            });

            let mut workers = JoinSet::new();
            for _ in 0..self.policy.concurrency.max(1) {
                let worker = Arc::clone(&shared);
                workers.spawn(async move { worker.drain().await }.in_current_span());
            }
            let mut first_error = None;
            while let Some(joined) = workers.join_next().await {
                let outcome = joined
                    .map_err(ScoringError::from)
                    .and_then(|res| res.map_err(ScoringError::from));
                if let Err(err) = outcome {
                    first_error.get_or_insert(err);
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }

            let mut result = lock(&shared.tally).clone();
            result.skipped += lock(&shared.queue).len() as u64;
            result.stopped = lock(&shared.stop).clone();
            info!(
                scored = result.scored,
                failed = result.failed,
                skipped = result.skipped,
                model_calls = result.model_calls,
                stopped = ?result.stopped,
                "scoring finished"
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }
}

/// State shared by the worker tasks of one stage run.
struct Worker {
    store: Store,
    clock: Arc<dyn Clock>,
    policy: ScoringPolicy,
    classifier: Option<Classifier>,
    scorer: Arc<dyn SentimentScorer>,
    bucket: Option<TokenBucket>,
    cancel: CancelSignal,
    deadline: Option<Instant>,
    queue: Mutex<VecDeque<ScoreCandidate>>,
    pause_until: Mutex<Option<Instant>>,
    stop: Mutex<Option<StopReason>>,
    tally: Mutex<ScoringResult>,
}

enum CallOutcome {
    Done(Result<Sentiment, ScoreError>),
    Interrupted,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Worker {
    async fn drain(&self) -> Result<(), StoreError> {
        loop {
            if self.check_stop().is_some() {
                return Ok(());
            }
            let next = lock(&self.queue).pop_front();
            let Some(candidate) = next else {
                return Ok(());
            };
            self.process(candidate).await?;
        }
    }

    /// Current stop reason, recording cancellation or an expired deadline first.
    fn check_stop(&self) -> Option<StopReason> {
        let mut stop = lock(&self.stop);
        if stop.is_none() {
            if self.cancel.is_cancelled() {
                *stop = Some(StopReason::Cancelled);
            } else if self.deadline.is_some_and(|at| self.clock.now() >= at) {
                *stop = Some(StopReason::Deadline);
            }
        }
        stop.clone()
    }

    fn set_stop(&self, reason: StopReason) {
        lock(&self.stop).get_or_insert(reason);
    }

    fn classify(&self, err: &ScoreError) -> Disposition {
        match &self.classifier {
            Some(classifier) => classifier(err),
            None => self.scorer.classify(err),
        }
    }

    async fn process(&self, candidate: ScoreCandidate) -> Result<(), StoreError> {
        let id = candidate.item_id.as_str();
        let Some(mut attempts) = self
            .store
            .claim(id, self.policy.max_attempts, self.clock.wall())
            .await?
        else {
            debug!(item = id, "claim lost");
            lock(&self.tally).skipped += 1;
            return Ok(());
        };

        if attempts >= self.policy.max_attempts {
            self.store.mark_exhausted(id, self.clock.wall()).await?;
            let mut tally = lock(&self.tally);
            tally.failed += 1;
            tally.note_error(id, "attempt budget exhausted");
            return Ok(());
        }

        loop {
            self.throttle().await;
            if self.check_stop().is_some() {
                self.store
                    .release_claim(id, None, false, self.clock.wall())
                    .await?;
                lock(&self.tally).skipped += 1;
                return Ok(());
            }

            lock(&self.tally).model_calls += 1;
            let err = match self.call(&candidate.text).await {
                CallOutcome::Interrupted => {
                    self.check_stop();
                    self.store
                        .release_claim(id, Some("interrupted before completion"), false, self.clock.wall())
                        .await?;
                    lock(&self.tally).skipped += 1;
                    return Ok(());
                }
                CallOutcome::Done(Ok(sentiment)) => {
                    let written = self
                        .store
                        .record_success(id, sentiment, self.scorer.model(), self.clock.wall())
                        .await?;
                    if written {
                        debug!(item = id, label = %sentiment.label, "scored");
                        lock(&self.tally).scored += 1;
                    } else {
                        warn!(item = id, "claim vanished before the score was written");
                        lock(&self.tally).skipped += 1;
                    }
                    return Ok(());
                }
                CallOutcome::Done(Err(err)) => err,
            };

            let message = err.to_string();
            let disposition = self.classify(&err);
            debug!(item = id, attempt = attempts + 1, ?disposition, error = %message, "scoring call failed");

            let delay = match disposition {
                Disposition::Fail => {
                    self.store
                        .mark_failed(id, &message, true, self.clock.wall())
                        .await?;
                    let mut tally = lock(&self.tally);
                    tally.failed += 1;
                    tally.note_error(id, &message);
                    return Ok(());
                }
                Disposition::Abort => {
                    warn!(item = id, error = %message, "scorer aborted the run");
                    self.store
                        .release_claim(id, Some(&message), false, self.clock.wall())
                        .await?;
                    self.set_stop(StopReason::Aborted(message.clone()));
                    let mut tally = lock(&self.tally);
                    tally.skipped += 1;
                    tally.note_error(id, &message);
                    return Ok(());
                }
                Disposition::Backpressure(retry_after) => {
                    let pause = retry_after
                        .unwrap_or(self.policy.rate_limit_cooldown)
                        .min(self.policy.max_rate_limit_pause);
                    self.pause_stage(pause);
                    Duration::ZERO
                }
                Disposition::Retry => self.policy.backoff.delay_for_attempt(attempts as usize),
            };

            if attempts + 1 >= self.policy.max_attempts {
                self.store
                    .mark_failed(id, &message, false, self.clock.wall())
                    .await?;
                let mut tally = lock(&self.tally);
                tally.failed += 1;
                tally.note_error(id, &message);
                return Ok(());
            }

            match self
                .store
                .record_retry(id, &message, self.clock.wall())
                .await?
            {
                Some(now_spent) => attempts = now_spent,
                None => {
                    lock(&self.tally).skipped += 1;
                    return Ok(());
                }
            }
            self.sleep(delay).await;
        }
    }

    /// One scorer call, bounded by the call timeout and interrupted by
    /// cancellation or the run deadline.
    async fn call(&self, text: &str) -> CallOutcome {
        let timeout = self.policy.call_timeout;
        tokio::select! {
            biased;
            outcome = tokio::time::timeout(timeout, self.scorer.score(text)) => {
                CallOutcome::Done(outcome.unwrap_or_else(|_| {
                    Err(ScoreError::Transient(format!("call timed out after {timeout:?}")))
                }))
            }
            _ = self.cancel.cancelled() => CallOutcome::Interrupted,
            _ = self.until_deadline() => CallOutcome::Interrupted,
        }
    }

    async fn until_deadline(&self) {
        match self.deadline {
            Some(at) => {
                let remaining = at.saturating_duration_since(self.clock.now());
                self.clock.sleep(remaining).await;
            }
            None => future::pending::<()>().await,
        }
    }

    fn pause_stage(&self, pause: Duration) {
        let resume_at = self.clock.now() + pause;
        let mut pause_until = lock(&self.pause_until);
        if pause_until.map_or(true, |current| current < resume_at) {
            *pause_until = Some(resume_at);
        }
        info!(?pause, "rate limited, pausing scoring");
    }

    /// Wait out any stage-wide pause, then take a pacing token.
    async fn throttle(&self) {
        loop {
            let wait = lock(&self.pause_until)
                .map(|until| until.saturating_duration_since(self.clock.now()))
                .filter(|wait| !wait.is_zero());
            match wait {
                Some(wait) => {
                    self.sleep(wait).await;
                    if self.check_stop().is_some() {
                        return;
                    }
                }
                None => break,
            }
        }
        if let Some(bucket) = &self.bucket {
            tokio::select! {
                _ = bucket.take() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// Sleep on the stage clock, cut short by cancellation or the deadline.
    async fn sleep(&self, duration: Duration) {
        let duration = match self.deadline {
            Some(at) => duration.min(at.saturating_duration_since(self.clock.now())),
            None => duration,
        };
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.clock.sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rsm_core::{RawItem, ScoreStatus, SentimentLabel};
    use rsm_storage::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::{tempdir, TempDir};

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, min, 0).single().expect("ts")
    }

    fn raw(id: &str, min: u32) -> RawItem {
        RawItem {
            id: id.into(),
            source_id: "test".into(),
            source_created_at: ts(min),
            text: format!("text of {id}"),
            fetched_at: ts(min),
            channel: Some("stocks".into()),
            author: None,
            parent_title: None,
        }
    }

    async fn store_with(items: &[RawItem]) -> (TempDir, Store) {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("rsm.db")).await.expect("store");
        store.put_items(items).await.expect("items");
        (dir, store)
    }

    /// Fails with `errors` in order, then succeeds with a positive score.
    struct ScriptedScorer {
        errors: Mutex<VecDeque<ScoreError>>,
        calls: AtomicU32,
    }

    impl ScriptedScorer {
        fn new(errors: Vec<ScoreError>) -> Arc<Self> {
            Arc::new(Self {
                errors: Mutex::new(errors.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl SentimentScorer for ScriptedScorer {
        async fn score(&self, _text: &str) -> Result<Sentiment, ScoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match lock(&self.errors).pop_front() {
                Some(err) => Err(err),
                None => Ok(Sentiment::new(SentimentLabel::Positive, 0.9).expect("sentiment")),
            }
        }
    }

    struct AlwaysFails(ScoreError);

    #[async_trait]
    impl SentimentScorer for AlwaysFails {
        async fn score(&self, _text: &str) -> Result<Sentiment, ScoreError> {
            Err(self.0.clone())
        }
    }

    fn stage(store: &Store, clock: &Arc<ManualClock>, policy: ScoringPolicy) -> ScoringStage {
        let clock: Arc<dyn Clock> = clock.clone();
        ScoringStage::new(store.clone(), clock, policy)
    }

    #[tokio::test]
    async fn transient_failures_exhaust_into_failed_after_max_attempts() {
        let (_dir, store) = store_with(&[raw("a", 1)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = Arc::new(AlwaysFails(ScoreError::Transient("503".into())));

        let result = stage(&store, &clock, ScoringPolicy::default())
            .run(scorer)
            .await
            .unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.model_calls, 3);
        let record = store.get_score("a").await.unwrap().unwrap();
        assert_eq!(record.status, ScoreStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(!record.permanent);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn rate_limit_pauses_the_stage_then_succeeds() {
        let (_dir, store) = store_with(&[raw("a", 1)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = ScriptedScorer::new(vec![ScoreError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
            message: "slow down".into(),
        }]);

        let result = stage(&store, &clock, ScoringPolicy::default())
            .run(scorer.clone())
            .await
            .unwrap();

        assert_eq!(result.scored, 1);
        assert!(clock.elapsed() >= Duration::from_secs(5));
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
        let record = store.get_score("a").await.unwrap().unwrap();
        assert_eq!(record.status, ScoreStatus::Scored);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn rate_limit_without_hint_uses_cooldown() {
        let (_dir, store) = store_with(&[raw("a", 1)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = ScriptedScorer::new(vec![ScoreError::RateLimited {
            retry_after: None,
            message: "429".into(),
        }]);
        let policy = ScoringPolicy {
            rate_limit_cooldown: Duration::from_secs(7),
            ..ScoringPolicy::default()
        };

        stage(&store, &clock, policy).run(scorer).await.unwrap();
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(7)]);
    }

    #[tokio::test]
    async fn huge_retry_hint_is_capped_at_max_pause() {
        let (_dir, store) = store_with(&[raw("a", 1)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = ScriptedScorer::new(vec![ScoreError::RateLimited {
            retry_after: Some(Duration::MAX),
            message: "come back next century".into(),
        }]);
        let policy = ScoringPolicy {
            max_rate_limit_pause: Duration::from_secs(45),
            ..ScoringPolicy::default()
        };

        let result = stage(&store, &clock, policy).run(scorer).await.unwrap();
        assert_eq!(result.scored, 1);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(45)]);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (_dir, store) = store_with(&[raw("a", 1)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = Arc::new(AlwaysFails(ScoreError::Permanent("bad json".into())));

        let result = stage(&store, &clock, ScoringPolicy::default())
            .run(scorer)
            .await
            .unwrap();
        assert_eq!((result.failed, result.model_calls), (1, 1));
        let record = store.get_score("a").await.unwrap().unwrap();
        assert_eq!(record.status, ScoreStatus::Failed);
        assert!(record.permanent);
        assert_eq!(record.attempts, 1);

        // permanent failures are not picked up again
        let again = stage(&store, &clock, ScoringPolicy::default())
            .run(Arc::new(AlwaysFails(ScoreError::Permanent("x".into()))))
            .await
            .unwrap();
        assert_eq!(again.model_calls, 0);
    }

    #[tokio::test]
    async fn auth_failure_aborts_and_leaves_items_pending() {
        let (_dir, store) = store_with(&[raw("a", 1), raw("b", 2)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = Arc::new(AlwaysFails(ScoreError::Auth("invalid api key".into())));

        let result = stage(&store, &clock, ScoringPolicy::default())
            .run(scorer)
            .await
            .unwrap();
        assert!(matches!(result.stopped, Some(StopReason::Aborted(_))));
        assert_eq!(result.model_calls, 1);
        assert_eq!(result.skipped, 2);
        for id in ["a", "b"] {
            let record = store.get_score(id).await.unwrap().unwrap();
            assert_eq!(record.status, ScoreStatus::Pending);
            assert_eq!(record.attempts, 0);
        }
        assert!(store
            .get_score("a")
            .await
            .unwrap()
            .unwrap()
            .last_error
            .is_some_and(|e| e.contains("invalid api key")));
    }

    #[tokio::test]
    async fn classifier_override_takes_precedence() {
        let (_dir, store) = store_with(&[raw("a", 1)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = Arc::new(AlwaysFails(ScoreError::Transient("flaky".into())));

        let result = stage(&store, &clock, ScoringPolicy::default())
            .with_classifier(|_| Disposition::Fail)
            .run(scorer)
            .await
            .unwrap();
        assert_eq!((result.failed, result.model_calls), (1, 1));
        assert!(store.get_score("a").await.unwrap().unwrap().permanent);
    }

    #[tokio::test]
    async fn deadline_releases_claim_back_to_pending() {
        let (_dir, store) = store_with(&[raw("a", 1), raw("b", 2)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = Arc::new(AlwaysFails(ScoreError::Transient("slow".into())));
        let policy = ScoringPolicy {
            max_attempts: 10,
            run_deadline: Some(Duration::from_secs(10)),
            backoff: BackoffPolicy {
                max_retries: 10,
                base_delay: Duration::from_secs(4),
                max_delay: Duration::from_secs(60),
            },
            ..ScoringPolicy::default()
        };

        let result = stage(&store, &clock, policy).run(scorer).await.unwrap();
        assert_eq!(result.stopped, Some(StopReason::Deadline));
        assert_eq!(result.model_calls, 2);
        assert_eq!(clock.elapsed(), Duration::from_secs(10));

        let a = store.get_score("a").await.unwrap().unwrap();
        assert_eq!(a.status, ScoreStatus::Pending);
        assert_eq!(a.attempts, 2);
        let b = store.get_score("b").await.unwrap().unwrap();
        assert_eq!((b.status, b.attempts), (ScoreStatus::Pending, 0));
    }

    /// Cancels the run from inside the call and never answers.
    struct CancelsMidCall(CancelSignal);

    #[async_trait]
    impl SentimentScorer for CancelsMidCall {
        async fn score(&self, _text: &str) -> Result<Sentiment, ScoreError> {
            self.0.cancel();
            future::pending().await
        }
    }

    #[tokio::test]
    async fn cancellation_drops_in_flight_call_without_partial_record() {
        let (_dir, store) = store_with(&[raw("a", 1), raw("b", 2)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let cancel = CancelSignal::new();

        let result = stage(&store, &clock, ScoringPolicy::default())
            .with_cancel(cancel.clone())
            .run(Arc::new(CancelsMidCall(cancel)))
            .await
            .unwrap();
        assert_eq!(result.stopped, Some(StopReason::Cancelled));
        assert_eq!(result.scored, 0);
        let record = store.get_score("a").await.unwrap().unwrap();
        assert_eq!(record.status, ScoreStatus::Pending);
        assert!(record.sentiment.is_none());
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn concurrent_workers_score_each_item_once() {
        let items: Vec<_> = (0..12).map(|i| raw(&format!("t1_{i:02}"), i)).collect();
        let (_dir, store) = store_with(&items).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let scorer = ScriptedScorer::new(Vec::new());
        let policy = ScoringPolicy {
            concurrency: 4,
            ..ScoringPolicy::default()
        };

        let result = stage(&store, &clock, policy)
            .run(scorer.clone())
            .await
            .unwrap();
        assert_eq!(result.scored, 12);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 12);

        let again = stage(&store, &clock, ScoringPolicy::default())
            .run(scorer.clone())
            .await
            .unwrap();
        assert_eq!(again.model_calls, 0);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn pacing_spaces_calls_on_the_clock() {
        let (_dir, store) = store_with(&[raw("a", 1), raw("b", 2), raw("c", 3)]).await;
        let clock = Arc::new(ManualClock::new(ts(30)));
        let policy = ScoringPolicy {
            rate: Some(TokenBucketConfig::per_interval(1, Duration::from_secs(3))),
            ..ScoringPolicy::default()
        };

        let result = stage(&store, &clock, policy)
            .run(ScriptedScorer::new(Vec::new()))
            .await
            .unwrap();
        assert_eq!(result.scored, 3);
        assert!(clock.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn stale_claims_are_recovered_and_reenable_is_bounded() {
        let (_dir, store) = store_with(&[raw("a", 1), raw("b", 2)]).await;
        let now = ts(30);
        store.seed_pending(now).await.unwrap();
        // "a" was claimed by a run that crashed
        store.claim("a", 3, now).await.unwrap();
        // "b" failed for good earlier
        store.claim("b", 3, now).await.unwrap();
        store.mark_failed("b", "boom", true, now).await.unwrap();

        let clock = Arc::new(ManualClock::new(now));
        let policy = ScoringPolicy {
            retry_failed: true,
            max_reenables: 1,
            ..ScoringPolicy::default()
        };
        let result = stage(&store, &clock, policy.clone())
            .run(Arc::new(AlwaysFails(ScoreError::Permanent("still bad".into()))))
            .await
            .unwrap();
        assert_eq!(result.failed, 2);
        assert_eq!(store.get_score("b").await.unwrap().unwrap().reenables, 1);

        let result = stage(&store, &clock, policy)
            .run(ScriptedScorer::new(Vec::new()))
            .await
            .unwrap();
        // "a" gets its one re-enable; "b" already used it
        assert_eq!(result.scored, 1);
        assert_eq!(
            store.get_score("a").await.unwrap().unwrap().status,
            ScoreStatus::Scored
        );
        assert_eq!(
            store.get_score("b").await.unwrap().unwrap().status,
            ScoreStatus::Failed
        );
    }
}
