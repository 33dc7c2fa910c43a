//! Source and scorer capability contracts plus their Reddit, fixture and OpenAI
//! implementations.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsm_core::{
    default_disposition, Cursor, Disposition, RawItem, ScoreError, Sentiment, SourceError,
    SourcePage,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

mod openai;
mod reddit;

pub use openai::{parse_sentiment_content, OpenAiConfig, OpenAiScorer};
pub use reddit::{flatten_comments, Listing, RedditComment, RedditConfig, RedditSource};

pub const CRATE_NAME: &str = "rsm-adapters";

/// Where new items come from. A run walks the source's current snapshot in
/// ascending `(source_created_at, id)` order; items already stored are
/// skipped by id on insert, so late arrivals older than the watermark still land.
#[async_trait]
pub trait ItemSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// The first page of a run is requested with `cursor.token` (usually
    /// `None`), later pages with whatever the previous page returned in `next`.
    async fn fetch_page(
        &self,
        cursor: &Cursor,
        page_token: Option<&str>,
    ) -> Result<SourcePage, SourceError>;
}

/// External sentiment backend.
#[async_trait]
pub trait SentimentScorer: Send + Sync {
    /// Model name recorded alongside successful scores.
    fn model(&self) -> Option<&str> {
        None
    }

    async fn score(&self, text: &str) -> Result<Sentiment, ScoreError>;

    /// Backend-specific view of which failures are worth retrying.
    fn classify(&self, err: &ScoreError) -> Disposition {
        default_disposition(err)
    }
}

/// Slice a snapshot sorted by [`order_snapshot`] into pages. A token names the
/// last item served (`<created_at millis>:<id>`), so a walk resumed on a
/// refreshed snapshot neither skips nor repeats items that shared a timestamp.
pub fn paginate(
    snapshot: &[RawItem],
    page_token: Option<&str>,
    page_size: usize,
) -> Result<SourcePage, SourceError> {
    let start = match page_token {
        None => 0,
        Some(token) => {
            let after = parse_page_token(token)?;
            snapshot.partition_point(|item| page_key(item) <= (after.0, after.1))
        }
    };
    let page_size = page_size.max(1);
    let end = start.saturating_add(page_size).min(snapshot.len());
    let items = snapshot.get(start..end).unwrap_or_default().to_vec();
    let next = if end < snapshot.len() {
        items.last().map(page_token_for)
    } else {
        None
    };
    Ok(SourcePage { items, next })
}

/// Sort and dedup a snapshot the way sources must deliver it.
pub fn order_snapshot(mut items: Vec<RawItem>) -> Vec<RawItem> {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.id.clone()));
    items.sort_by(|a, b| page_key(a).cmp(&page_key(b)));
    items
}

fn page_key(item: &RawItem) -> (i64, &str) {
    (item.source_created_at.timestamp_millis(), item.id.as_str())
}

fn page_token_for(item: &RawItem) -> String {
    let (millis, id) = page_key(item);
    format!("{millis}:{id}")
}

fn parse_page_token(token: &str) -> Result<(i64, &str), SourceError> {
    token
        .split_once(':')
        .and_then(|(millis, id)| Some((millis.parse::<i64>().ok()?, id)))
        .ok_or_else(|| SourceError::Unavailable(format!("invalid page token {token:?}")))
}

/// True for the first page request of a run: a fresh walk or a resumed one.
pub(crate) fn starts_run(cursor: &Cursor, page_token: Option<&str>) -> bool {
    page_token.is_none() || page_token == cursor.token.as_deref()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureItem {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub parent_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFile {
    pub items: Vec<FixtureItem>,
}

pub fn load_fixture_file(path: impl AsRef<Path>) -> Result<FixtureFile> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline source reading items from a JSON fixture file. The file is re-read
/// at the start of every run so edits show up as new items.
#[derive(Debug)]
pub struct FixtureSource {
    path: PathBuf,
    page_size: usize,
    snapshot: Mutex<Vec<RawItem>>,
}

impl FixtureSource {
    pub const SOURCE_ID: &'static str = "fixture";

    pub fn new(path: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            path: path.into(),
            page_size,
            snapshot: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ItemSource for FixtureSource {
    fn source_id(&self) -> &str {
        Self::SOURCE_ID
    }

    async fn fetch_page(
        &self,
        cursor: &Cursor,
        page_token: Option<&str>,
    ) -> Result<SourcePage, SourceError> {
        let mut snapshot = self.snapshot.lock().await;
        if starts_run(cursor, page_token) {
            let file = load_fixture_file(&self.path)
                .map_err(|err| SourceError::Unavailable(format!("{err:#}")))?;
            let fetched_at = Utc::now();
            let items = file
                .items
                .into_iter()
                .filter(|item| !item.text.trim().is_empty())
                .map(|item| RawItem {
                    id: item.id,
                    source_id: Self::SOURCE_ID.to_string(),
                    source_created_at: item.created_at,
                    text: item.text,
                    fetched_at,
                    channel: item.channel,
                    author: item.author,
                    parent_title: item.parent_title,
                })
                .collect();
            *snapshot = order_snapshot(items);
        }
        paginate(&snapshot, page_token, self.page_size)
    }
}
