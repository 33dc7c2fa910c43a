//! Durable item, score and cursor tables on SQLite.
//!
//! Timestamps are stored as unix epoch milliseconds so range queries and
//! ordering stay numeric. Every score transition is a single guarded `UPDATE`,
//! which keeps each record either fully written or untouched.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rsm_core::{Cursor, RawItem, ScoreRecord, ScoreStatus, ScoredItem, Sentiment, SentimentLabel};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("preparing database location: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt value in {table}.{column}: {message}")]
    Corrupt {
        table: &'static str,
        column: &'static str,
        message: String,
    },
}

/// Item selected for scoring, with the attempts already spent on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreCandidate {
    pub item_id: String,
    pub text: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    /// Items that have no score record yet.
    pub unscored: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub scored: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        debug!(path = %path.display(), "state store opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Start a write transaction. Dropping the handle without `commit` rolls back.
    pub async fn begin(&self) -> Result<StoreTx, StoreError> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    /// Insert items in their own transaction; duplicates are ignored.
    pub async fn put_items(&self, items: &[RawItem]) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let inserted = tx.put_items(items).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_cursor(&self) -> Result<Cursor, StoreError> {
        read_cursor(&self.pool).await
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<RawItem>, StoreError> {
        let row = sqlx::query(
            "SELECT id, source_id, source_created_at, text, fetched_at, channel, author, parent_title \
             FROM items WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| item_from_row(&row)).transpose()
    }

    pub async fn item_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Create a `pending` record for every item that has none.
    pub async fn seed_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO scores (item_id, status, attempts, reenables, permanent, updated_at) \
             SELECT id, 'pending', 0, 0, 0, ? FROM items \
             WHERE NOT EXISTS (SELECT 1 FROM scores WHERE scores.item_id = items.id)",
        )
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Return orphaned claims to `pending`. Only safe while holding the run lock.
    pub async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE scores SET status = 'pending', updated_at = ? WHERE status = 'in_progress'",
        )
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Put failed records back to `pending` with a fresh attempt budget, at most
    /// `max_reenables` times per record.
    pub async fn reenable_failed(
        &self,
        max_reenables: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE scores \
             SET status = 'pending', attempts = 0, permanent = 0, reenables = reenables + 1, updated_at = ? \
             WHERE status = 'failed' AND reenables < ?",
        )
        .bind(now.timestamp_millis())
        .bind(i64::from(max_reenables))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Items lacking a successful score, oldest fetch first.
    pub async fn select_candidates(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ScoreCandidate>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.item_id, i.text, s.attempts FROM scores s \
             JOIN items i ON i.id = s.item_id \
             WHERE s.status = 'pending' \
                OR (s.status = 'failed' AND s.permanent = 0 AND s.attempts < ?) \
             ORDER BY i.fetched_at ASC, i.id ASC \
             LIMIT ?",
        )
        .bind(i64::from(max_attempts))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ScoreCandidate, StoreError> {
                Ok(ScoreCandidate {
                    item_id: row.try_get("item_id")?,
                    text: row.try_get("text")?,
                    attempts: to_u32("scores", "attempts", row.try_get("attempts")?)?,
                })
            })
            .collect()
    }

    /// Atomically move an eligible record to `in_progress`. Returns the attempts
    /// already spent, or `None` if another worker (or an earlier run) got there first.
    pub async fn claim(
        &self,
        item_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE scores SET status = 'in_progress', updated_at = ? \
             WHERE item_id = ? \
               AND (status = 'pending' \
                    OR (status = 'failed' AND permanent = 0 AND attempts < ?)) \
             RETURNING attempts",
        )
        .bind(now.timestamp_millis())
        .bind(item_id)
        .bind(i64::from(max_attempts))
        .fetch_optional(&self.pool)
        .await?;
        attempts
            .map(|value| to_u32("scores", "attempts", value))
            .transpose()
    }

    pub async fn record_success(
        &self,
        item_id: &str,
        sentiment: Sentiment,
        model: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scores \
             SET status = 'scored', label = ?, confidence = ?, model = ?, \
                 attempts = attempts + 1, last_error = NULL, permanent = 0, updated_at = ? \
             WHERE item_id = ? AND status = 'in_progress'",
        )
        .bind(sentiment.label.as_str())
        .bind(sentiment.confidence)
        .bind(model)
        .bind(now.timestamp_millis())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count a failed attempt while keeping the claim. Returns the new attempt count.
    pub async fn record_retry(
        &self,
        item_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE scores SET attempts = attempts + 1, last_error = ?, updated_at = ? \
             WHERE item_id = ? AND status = 'in_progress' \
             RETURNING attempts",
        )
        .bind(error)
        .bind(now.timestamp_millis())
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        attempts
            .map(|value| to_u32("scores", "attempts", value))
            .transpose()
    }

    /// Count the final failed attempt and mark the record `failed`.
    pub async fn mark_failed(
        &self,
        item_id: &str,
        error: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scores \
             SET status = 'failed', attempts = attempts + 1, last_error = ?, permanent = ?, updated_at = ? \
             WHERE item_id = ? AND status = 'in_progress'",
        )
        .bind(error)
        .bind(permanent)
        .bind(now.timestamp_millis())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark a claimed record `failed` without spending another attempt.
    pub async fn mark_exhausted(&self, item_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scores SET status = 'failed', updated_at = ? \
             WHERE item_id = ? AND status = 'in_progress'",
        )
        .bind(now.timestamp_millis())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give a claim back as `pending`, optionally counting the interrupted attempt.
    pub async fn release_claim(
        &self,
        item_id: &str,
        error: Option<&str>,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scores \
             SET status = 'pending', attempts = attempts + ?, last_error = COALESCE(?, last_error), updated_at = ? \
             WHERE item_id = ? AND status = 'in_progress'",
        )
        .bind(i64::from(count_attempt))
        .bind(error)
        .bind(now.timestamp_millis())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_score(&self, item_id: &str) -> Result<Option<ScoreRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT item_id, status, label, confidence, model, attempts, reenables, permanent, last_error, updated_at \
             FROM scores WHERE item_id = ?",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| score_from_row(&row)).transpose()
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM scores GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StatusCounts::default();
        let mut recorded = 0u64;
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n = row.try_get::<i64, _>("n")?.max(0) as u64;
            recorded += n;
            match ScoreStatus::parse(&status) {
                Some(ScoreStatus::Pending) => counts.pending = n,
                Some(ScoreStatus::InProgress) => counts.in_progress = n,
                Some(ScoreStatus::Scored) => counts.scored = n,
                Some(ScoreStatus::Failed) => counts.failed = n,
                None => return Err(corrupt("scores", "status", format!("unknown status {status:?}"))),
            }
        }
        counts.unscored = self.item_count().await?.saturating_sub(recorded);
        Ok(counts)
    }

    /// Scored items whose `fetched_at` lies in `[since, until)`. Never returns
    /// records in any other status.
    pub async fn get_scores(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScoredItem>, StoreError> {
        let since = since.map(|ts| ts.timestamp_millis());
        let until = until.map(|ts| ts.timestamp_millis());
        let rows = sqlx::query(
            "SELECT s.item_id, s.label, s.confidence, i.fetched_at, i.channel FROM scores s \
             JOIN items i ON i.id = s.item_id \
             WHERE s.status = 'scored' \
               AND (? IS NULL OR i.fetched_at >= ?) \
               AND (? IS NULL OR i.fetched_at < ?) \
             ORDER BY i.fetched_at ASC, i.id ASC",
        )
        .bind(since)
        .bind(since)
        .bind(until)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ScoredItem, StoreError> {
                let label: String = row.try_get("label")?;
                let confidence: f64 = row.try_get("confidence")?;
                Ok(ScoredItem {
                    item_id: row.try_get("item_id")?,
                    sentiment: sentiment_from_parts(&label, confidence)?,
                    fetched_at: from_millis("items", "fetched_at", row.try_get("fetched_at")?)?,
                    channel: row.try_get("channel")?,
                })
            })
            .collect()
    }

    /// Most recently failed records with their last error.
    pub async fn recent_failures(&self, limit: usize) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT item_id, COALESCE(last_error, '') AS last_error FROM scores \
             WHERE status = 'failed' ORDER BY updated_at DESC, item_id ASC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(String, String), StoreError> {
                Ok((row.try_get("item_id")?, row.try_get("last_error")?))
            })
            .collect()
    }

    /// Drop every score record; items and the cursor stay.
    pub async fn clear_scores(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM scores").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Drop scores, items and the cursor in one transaction.
    pub async fn clear_all(&self) -> Result<(u64, u64), StoreError> {
        let mut tx = self.pool.begin().await?;
        let scores = sqlx::query("DELETE FROM scores")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let items = sqlx::query("DELETE FROM items")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM cursor").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok((scores, items))
    }
}

/// Write transaction covering item inserts and the cursor, so a batch and the
/// watermark that follows it commit together or not at all.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    /// Insert items not already present; returns the number of new rows.
    pub async fn put_items(&mut self, items: &[RawItem]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for item in items {
            let result = sqlx::query(
                "INSERT INTO items \
                 (id, source_id, source_created_at, text, fetched_at, channel, author, parent_title) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&item.id)
            .bind(&item.source_id)
            .bind(item.source_created_at.timestamp_millis())
            .bind(&item.text)
            .bind(item.fetched_at.timestamp_millis())
            .bind(item.channel.as_deref())
            .bind(item.author.as_deref())
            .bind(item.parent_title.as_deref())
            .execute(&mut *self.tx)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn get_cursor(&mut self) -> Result<Cursor, StoreError> {
        read_cursor(&mut *self.tx).await
    }

    pub async fn set_cursor(&mut self, cursor: &Cursor) -> Result<(), StoreError> {
        let updated_at = cursor.updated_at.unwrap_or_else(Utc::now);
        sqlx::query(
            "INSERT INTO cursor (id, watermark, token, updated_at) VALUES (1, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 watermark = excluded.watermark, \
                 token = excluded.token, \
                 updated_at = excluded.updated_at",
        )
        .bind(cursor.watermark.map(|ts| ts.timestamp_millis()))
        .bind(cursor.token.as_deref())
        .bind(updated_at.timestamp_millis())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn read_cursor<'e, E>(executor: E) -> Result<Cursor, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT watermark, token, updated_at FROM cursor WHERE id = 1")
        .fetch_optional(executor)
        .await?;
    let Some(row) = row else {
        return Ok(Cursor::default());
    };
    let watermark: Option<i64> = row.try_get("watermark")?;
    Ok(Cursor {
        watermark: watermark
            .map(|value| from_millis("cursor", "watermark", value))
            .transpose()?,
        token: row.try_get("token")?,
        updated_at: Some(from_millis("cursor", "updated_at", row.try_get("updated_at")?)?),
    })
}

fn item_from_row(row: &SqliteRow) -> Result<RawItem, StoreError> {
    Ok(RawItem {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        source_created_at: from_millis("items", "source_created_at", row.try_get("source_created_at")?)?,
        text: row.try_get("text")?,
        fetched_at: from_millis("items", "fetched_at", row.try_get("fetched_at")?)?,
        channel: row.try_get("channel")?,
        author: row.try_get("author")?,
        parent_title: row.try_get("parent_title")?,
    })
}

fn score_from_row(row: &SqliteRow) -> Result<ScoreRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = ScoreStatus::parse(&status)
        .ok_or_else(|| corrupt("scores", "status", format!("unknown status {status:?}")))?;
    let label: Option<String> = row.try_get("label")?;
    let confidence: Option<f64> = row.try_get("confidence")?;
    let sentiment = match (label, confidence) {
        (Some(label), Some(confidence)) => Some(sentiment_from_parts(&label, confidence)?),
        _ => None,
    };
    Ok(ScoreRecord {
        item_id: row.try_get("item_id")?,
        status,
        sentiment,
        model: row.try_get("model")?,
        attempts: to_u32("scores", "attempts", row.try_get("attempts")?)?,
        reenables: to_u32("scores", "reenables", row.try_get("reenables")?)?,
        permanent: row.try_get("permanent")?,
        last_error: row.try_get("last_error")?,
        updated_at: from_millis("scores", "updated_at", row.try_get("updated_at")?)?,
    })
}

fn sentiment_from_parts(label: &str, confidence: f64) -> Result<Sentiment, StoreError> {
    let label = SentimentLabel::parse(label)
        .ok_or_else(|| corrupt("scores", "label", format!("unknown label {label:?}")))?;
    Sentiment::new(label, confidence)
        .ok_or_else(|| corrupt("scores", "confidence", format!("out of range: {confidence}")))
}

fn from_millis(
    table: &'static str,
    column: &'static str,
    value: i64,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| corrupt(table, column, format!("timestamp out of range: {value}")))
}

fn to_u32(table: &'static str, column: &'static str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| corrupt(table, column, format!("not a valid count: {value}")))
}

fn corrupt(table: &'static str, column: &'static str, message: String) -> StoreError {
    StoreError::Corrupt {
        table,
        column,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::{tempdir, TempDir};

    async fn open_store() -> (TempDir, Store) {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("state.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().expect("ts")
    }

    fn item(id: &str, hour: u32) -> RawItem {
        RawItem {
            id: id.to_string(),
            source_id: "fixture".into(),
            source_created_at: ts(hour),
            text: format!("text for {id}"),
            fetched_at: ts(hour + 1),
            channel: Some("stocks".into()),
            author: None,
            parent_title: None,
        }
    }

    fn positive() -> Sentiment {
        Sentiment::new(SentimentLabel::Positive, 0.9).expect("sentiment")
    }

    #[tokio::test]
    async fn put_items_ignores_duplicates() {
        let (_dir, store) = open_store().await;
        let first = store
            .put_items(&[item("a", 1), item("b", 2)])
            .await
            .expect("first insert");
        let second = store
            .put_items(&[item("b", 2), item("c", 3)])
            .await
            .expect("second insert");

        assert_eq!(first, 2);
        assert_eq!(second, 1);
        assert_eq!(store.item_count().await.unwrap(), 3);
        assert_eq!(store.get_item("a").await.unwrap(), Some(item("a", 1)));
    }

    #[tokio::test]
    async fn rolled_back_transaction_leaves_items_and_cursor_untouched() {
        let (_dir, store) = open_store().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.put_items(&[item("a", 1)]).await.unwrap();
            tx.set_cursor(&Cursor::default().advanced_to(Some(ts(1)), ts(2)))
                .await
                .unwrap();
            // dropped without commit
        }
        assert_eq!(store.item_count().await.unwrap(), 0);
        assert_eq!(store.get_cursor().await.unwrap(), Cursor::default());

        let mut tx = store.begin().await.unwrap();
        tx.put_items(&[item("a", 1)]).await.unwrap();
        tx.set_cursor(&Cursor::default().advanced_to(Some(ts(1)), ts(2)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let cursor = store.get_cursor().await.unwrap();
        assert_eq!(cursor.watermark, Some(ts(1)));
        assert_eq!(cursor.updated_at, Some(ts(2)));
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_scored_is_terminal() {
        let (_dir, store) = open_store().await;
        store.put_items(&[item("a", 1)]).await.unwrap();
        assert_eq!(store.seed_pending(ts(5)).await.unwrap(), 1);
        assert_eq!(store.seed_pending(ts(5)).await.unwrap(), 0);

        assert_eq!(store.claim("a", 3, ts(5)).await.unwrap(), Some(0));
        assert_eq!(store.claim("a", 3, ts(5)).await.unwrap(), None);

        assert!(store.record_success("a", positive(), Some("m"), ts(6)).await.unwrap());
        assert!(!store.record_success("a", positive(), Some("m"), ts(6)).await.unwrap());
        assert_eq!(store.claim("a", 3, ts(7)).await.unwrap(), None);
        assert_eq!(store.release_stale_claims(ts(7)).await.unwrap(), 0);

        // Even a raw update cannot move a scored record.
        let raw = sqlx::query("UPDATE scores SET status = 'pending', label = NULL, confidence = NULL")
            .execute(store.pool())
            .await;
        assert!(raw.is_err());

        let record = store.get_score("a").await.unwrap().expect("record");
        assert_eq!(record.status, ScoreStatus::Scored);
        assert_eq!(record.sentiment, Some(positive()));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.model.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn failed_records_follow_attempt_budget_and_reenable_limit() {
        let (_dir, store) = open_store().await;
        store.put_items(&[item("a", 1), item("b", 2)]).await.unwrap();
        store.seed_pending(ts(5)).await.unwrap();

        store.claim("a", 3, ts(5)).await.unwrap();
        assert_eq!(store.record_retry("a", "timeout", ts(5)).await.unwrap(), Some(1));
        assert!(store.mark_failed("a", "timeout", false, ts(5)).await.unwrap());

        store.claim("b", 3, ts(5)).await.unwrap();
        assert!(store.mark_failed("b", "malformed", true, ts(5)).await.unwrap());

        // "a" still has budget left (2 < 3); "b" failed permanently.
        let candidates = store.select_candidates(3, 10).await.unwrap();
        assert_eq!(
            candidates.iter().map(|c| c.item_id.as_str()).collect::<Vec<_>>(),
            vec!["a"]
        );
        assert!(store.select_candidates(2, 10).await.unwrap().is_empty());

        assert_eq!(store.reenable_failed(1, ts(6)).await.unwrap(), 2);
        let record = store.get_score("b").await.unwrap().unwrap();
        assert_eq!(record.status, ScoreStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.reenables, 1);
        assert!(!record.permanent);

        store.claim("b", 3, ts(6)).await.unwrap();
        store.mark_failed("b", "malformed", true, ts(6)).await.unwrap();
        assert_eq!(store.reenable_failed(1, ts(7)).await.unwrap(), 0);
        assert_eq!(
            store.recent_failures(5).await.unwrap(),
            vec![("b".to_string(), "malformed".to_string())]
        );
    }

    #[tokio::test]
    async fn get_scores_only_returns_scored_records_in_range() {
        let (_dir, store) = open_store().await;
        store
            .put_items(&[item("a", 1), item("b", 3), item("c", 5)])
            .await
            .unwrap();
        store.seed_pending(ts(8)).await.unwrap();
        store.claim("a", 3, ts(8)).await.unwrap();
        store.record_success("a", positive(), None, ts(8)).await.unwrap();
        store.claim("c", 3, ts(8)).await.unwrap();
        store.record_success("c", positive(), None, ts(8)).await.unwrap();
        store.claim("b", 3, ts(8)).await.unwrap();

        let all = store.get_scores(None, None).await.unwrap();
        assert_eq!(all.iter().map(|s| s.item_id.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);

        let windowed = store.get_scores(Some(ts(3)), Some(ts(7))).await.unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].item_id, "c");
        assert_eq!(windowed[0].fetched_at, ts(6));
        assert_eq!(windowed[0].channel.as_deref(), Some("stocks"));

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.scored, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.unscored, 0);

        assert_eq!(store.release_stale_claims(ts(9)).await.unwrap(), 1);
        assert_eq!(store.get_score("b").await.unwrap().unwrap().status, ScoreStatus::Pending);
    }

    #[tokio::test]
    async fn clear_all_resets_every_table() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();
        tx.put_items(&[item("a", 1)]).await.unwrap();
        tx.set_cursor(&Cursor::default().advanced_to(Some(ts(1)), ts(1)))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        store.seed_pending(ts(2)).await.unwrap();

        assert_eq!(store.clear_all().await.unwrap(), (1, 1));
        assert_eq!(store.item_count().await.unwrap(), 0);
        assert_eq!(store.get_cursor().await.unwrap(), Cursor::default());
    }
}
