//! Reddit comments via the OAuth API (application-only client credentials).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use rsm_core::{Cursor, RawItem, SourceError, SourcePage};
use rsm_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{order_snapshot, paginate, starts_run, ItemSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Listing {
    #[default]
    Hot,
    New,
    Rising,
    Top,
}

impl Listing {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::New => "new",
            Self::Rising => "rising",
            Self::Top => "top",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedditConfig {
    pub client_id: String,
    pub client_secret: String,
    pub subreddits: Vec<String>,
    pub listing: Listing,
    pub post_limit: u32,
    pub max_comments_per_post: usize,
    pub bot_usernames: Vec<String>,
    pub page_size: usize,
    pub auth_url: String,
    pub api_base: String,
}

impl RedditConfig {
    pub const DEFAULT_AUTH_URL: &'static str = "https://www.reddit.com/api/v1/access_token";
    pub const DEFAULT_API_BASE: &'static str = "https://oauth.reddit.com";
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

/// Comment as pulled out of a Reddit comment tree, before it becomes a [`RawItem`].
#[derive(Debug, Clone, PartialEq)]
pub struct RedditComment {
    pub fullname: String,
    pub body: String,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub subreddit: Option<String>,
}

pub struct RedditSource {
    config: RedditConfig,
    http: Arc<HttpFetcher>,
    snapshot: Mutex<Vec<RawItem>>,
}

impl RedditSource {
    pub const SOURCE_ID: &'static str = "reddit";

    pub fn new(config: RedditConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            config,
            http,
            snapshot: Mutex::new(Vec::new()),
        }
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let resp = self
            .http
            .send_with_retry(Self::SOURCE_ID, |client| {
                client
                    .post(&self.config.auth_url)
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body("grant_type=client_credentials")
            })
            .await
            .map_err(map_fetch_error)?;
        let token: AccessToken = resp
            .json()
            .map_err(|err| SourceError::Auth(format!("unexpected token response: {err}")))?;
        Ok(token.access_token)
    }

    async fn get_json(&self, token: &str, url: &str) -> Result<JsonValue, SourceError> {
        let resp = self
            .http
            .send_with_retry(Self::SOURCE_ID, |client| {
                client
                    .get(url)
                    .bearer_auth(token)
                    .header(ACCEPT, "application/json")
            })
            .await
            .map_err(map_fetch_error)?;
        resp.json()
            .map_err(|err| SourceError::Unavailable(format!("malformed JSON from {url}: {err}")))
    }

    async fn collect_snapshot(&self) -> Result<Vec<RawItem>, SourceError> {
        let token = self.access_token().await?;
        let bots: HashSet<String> = self
            .config
            .bot_usernames
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        let fetched_at = Utc::now();
        let mut items = Vec::new();

        for subreddit in &self.config.subreddits {
            let listing_url = format!(
                "{}/r/{}/{}?limit={}&raw_json=1",
                self.config.api_base,
                subreddit,
                self.config.listing.as_str(),
                self.config.post_limit
            );
            let listing = self.get_json(&token, &listing_url).await?;
            let posts = submissions(&listing);
            debug!(subreddit, posts = posts.len(), "listing fetched");

            for (post_id, title) in posts {
                let comments_url = format!(
                    "{}/comments/{}?limit={}&sort=new&raw_json=1",
                    self.config.api_base, post_id, self.config.max_comments_per_post
                );
                let thread = self.get_json(&token, &comments_url).await?;
                let mut comments = Vec::new();
                if let Some(tree) = thread.get(1) {
                    flatten_comments(tree, &mut comments);
                }
                if self.config.max_comments_per_post > 0 {
                    comments.truncate(self.config.max_comments_per_post);
                }

                for comment in comments {
                    let is_bot = comment
                        .author
                        .as_deref()
                        .is_some_and(|author| bots.contains(&author.to_ascii_lowercase()));
                    if is_bot {
                        continue;
                    }
                    items.push(RawItem {
                        id: comment.fullname,
                        source_id: Self::SOURCE_ID.to_string(),
                        source_created_at: comment.created_at,
                        text: comment.body,
                        fetched_at,
                        channel: comment.subreddit.or_else(|| Some(subreddit.clone())),
                        author: comment.author,
                        parent_title: Some(title.clone()),
                    });
                }
            }
        }

        let items = order_snapshot(items);
        info!(items = items.len(), "reddit snapshot collected");
        Ok(items)
    }
}

#[async_trait]
impl ItemSource for RedditSource {
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
            *snapshot = self.collect_snapshot().await?;
        }
        paginate(&snapshot, page_token, self.config.page_size)
    }
}

fn map_fetch_error(err: FetchError) -> SourceError {
    match err.status() {
        Some(401) | Some(403) => SourceError::Auth(err.to_string()),
        _ => SourceError::Unavailable(err.to_string()),
    }
}

/// `(id, title)` of every submission in a listing response.
fn submissions(listing: &JsonValue) -> Vec<(String, String)> {
    children(listing)
        .filter(|child| child.get("kind").and_then(JsonValue::as_str) == Some("t3"))
        .filter_map(|child| {
            let data = child.get("data")?;
            let id = data.get("id")?.as_str()?.to_string();
            let title = data
                .get("title")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            Some((id, title))
        })
        .collect()
}

fn children(listing: &JsonValue) -> impl Iterator<Item = &JsonValue> {
    listing
        .get("data")
        .and_then(|data| data.get("children"))
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
}

/// Depth-first walk of a comment listing. "more" stubs, deleted/removed and
/// empty comments are dropped.
pub fn flatten_comments(listing: &JsonValue, out: &mut Vec<RedditComment>) {
    for child in children(listing) {
        if child.get("kind").and_then(JsonValue::as_str) != Some("t1") {
            continue;
        }
        let Some(data) = child.get("data") else {
            continue;
        };

        if let Some(comment) = comment_from_data(data) {
            out.push(comment);
        }
        if let Some(replies) = data.get("replies").filter(|r| r.is_object()) {
            flatten_comments(replies, out);
        }
    }
}

fn comment_from_data(data: &JsonValue) -> Option<RedditComment> {
    let body = data.get("body")?.as_str()?.trim();
    if body.is_empty() || body == "[deleted]" || body == "[removed]" {
        return None;
    }
    let id = data.get("id")?.as_str()?;
    let fullname = data
        .get("name")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("t1_{id}"));
    let created = data.get("created_utc")?.as_f64()?;
    let created_at = DateTime::from_timestamp_millis((created * 1000.0) as i64)?;
    let author = data
        .get("author")
        .and_then(JsonValue::as_str)
        .filter(|a| *a != "[deleted]")
        .map(str::to_string);
    Some(RedditComment {
        fullname,
        body: body.to_string(),
        author,
        created_at,
        subreddit: data
            .get("subreddit")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
    })
}
