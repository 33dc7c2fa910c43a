//! Core domain model and capability contracts for RSM.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rsm-core";

/// One ingested unit of content awaiting sentiment scoring. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub source_id: String,
    pub source_created_at: DateTime<Utc>,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub parent_title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" | "bullish" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" | "bearish" => Some(Self::Negative),
            _ => None,
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured scoring result: label plus a confidence in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    pub confidence: f64,
}

impl Sentiment {
    /// Returns `None` when the confidence is not a finite value in `[0, 1]`.
    pub fn new(label: SentimentLabel, confidence: f64) -> Option<Self> {
        if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
            Some(Self { label, confidence })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStatus {
    Pending,
    /// Claim marker held by a scoring worker while the external call is in flight.
    InProgress,
    Scored,
    Failed,
}

impl ScoreStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Scored => "scored",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "scored" => Some(Self::Scored),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ScoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentiment outcome (or failure state) for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub item_id: String,
    pub status: ScoreStatus,
    pub sentiment: Option<Sentiment>,
    pub model: Option<String>,
    pub attempts: u32,
    pub reenables: u32,
    pub permanent: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted ingestion progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Newest `source_created_at` committed so far.
    pub watermark: Option<DateTime<Utc>>,
    /// Where the next run resumes when the previous one stopped at its page
    /// cap; `None` once the source has been read to the end.
    pub token: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Cursor {
    /// Cursor moved forward to `candidate`; never moves backwards.
    pub fn advanced_to(&self, candidate: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let watermark = match (self.watermark, candidate) {
            (Some(current), Some(seen)) => Some(current.max(seen)),
            (current, seen) => current.or(seen),
        };
        Self {
            watermark,
            token: self.token.clone(),
            updated_at: Some(now),
        }
    }
}

/// One page handed over by a source, sorted by `source_created_at` ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePage {
    pub items: Vec<RawItem>,
    /// Opaque token for the next page; `None` when the source is exhausted.
    pub next: Option<String>,
}

/// Read-only report row; only ever built from `scored` records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub item_id: String,
    pub sentiment: Sentiment,
    pub fetched_at: DateTime<Utc>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source rejected credentials: {0}")]
    Auth(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("transient scoring failure: {0}")]
    Transient(String),
    #[error("permanent scoring failure: {0}")]
    Permanent(String),
    #[error("scorer rejected credentials: {0}")]
    Auth(String),
}

/// What the scoring stage does with a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry the item after backoff.
    Retry,
    /// Retry the item and pause the whole stage first.
    Backpressure(Option<Duration>),
    /// Mark the item failed without retrying.
    Fail,
    /// Stop the stage; the item goes back to pending.
    Abort,
}

pub fn default_disposition(err: &ScoreError) -> Disposition {
    match err {
        ScoreError::RateLimited { retry_after, .. } => Disposition::Backpressure(*retry_after),
        ScoreError::Transient(_) => Disposition::Retry,
        ScoreError::Permanent(_) => Disposition::Fail,
        ScoreError::Auth(_) => Disposition::Abort,
    }
}
