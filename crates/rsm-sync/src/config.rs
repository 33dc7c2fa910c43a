//! Environment-driven configuration plus the optional `sources.yaml` registry.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rsm_adapters::{Listing, OpenAiConfig, RedditConfig};
use rsm_storage::{BackoffPolicy, TokenBucketConfig};
use serde::Deserialize;
use thiserror::Error;

use crate::lock::lock_path_for;
use crate::scoring::ScoringPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    MissingCredential(&'static str),
    #[error("reading {path}: {source}")]
    SourcesFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    SourcesFileParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Reddit,
    Fixture,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct RedditSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub database_path: PathBuf,
    pub lock_path: PathBuf,
    /// `None` disables per-run report files.
    pub reports_dir: Option<PathBuf>,
    pub source: SourceKind,
    pub sources_file: PathBuf,
    pub fixture_path: PathBuf,
    pub max_pages: Option<usize>,
    pub page_size: usize,
    pub scoring: ScoringPolicy,
    pub continue_on_ingest_error: bool,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub openai: OpenAiSettings,
    pub reddit: RedditSettings,
}

impl MinerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_path = var("RSM_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("rsm.db"));
        let lock_path = var("RSM_LOCK_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| lock_path_for(&database_path));
        let reports_dir = match lookup("RSM_REPORTS_DIR") {
            None => Some(PathBuf::from("reports")),
            Some(dir) if dir.trim().is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
        };
        let source = match var("RSM_SOURCE").as_deref() {
            None | Some("reddit") => SourceKind::Reddit,
            Some("fixture") => SourceKind::Fixture,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "RSM_SOURCE",
                    value: other.to_string(),
                    reason: "expected `reddit` or `fixture`".into(),
                })
            }
        };

        let defaults = ScoringPolicy::default();
        let backoff = BackoffPolicy {
            max_retries: defaults.backoff.max_retries,
            base_delay: Duration::from_millis(parse_or(
                &var,
                "RSM_BACKOFF_BASE_MS",
                defaults.backoff.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                &var,
                "RSM_BACKOFF_MAX_MS",
                defaults.backoff.max_delay.as_millis() as u64,
            )?),
        };
        let rate_interval = Duration::from_secs(parse_or(&var, "RSM_RATE_INTERVAL_SECS", 60u64)?);
        let rate = parse_opt::<u32, _>(&var, "RSM_REQUESTS_PER_INTERVAL")?
            .map(|requests| TokenBucketConfig::per_interval(requests, rate_interval));

        let scoring = ScoringPolicy {
            max_attempts: parse_or(&var, "RSM_MAX_ATTEMPTS", defaults.max_attempts)?,
            max_reenables: parse_or(&var, "RSM_MAX_REENABLES", defaults.max_reenables)?,
            retry_failed: parse_bool(&var, "RSM_RETRY_FAILED", defaults.retry_failed)?,
            rate,
            concurrency: parse_or(&var, "RSM_CONCURRENCY", defaults.concurrency)?,
            run_deadline: parse_opt::<u64, _>(&var, "RSM_RUN_DEADLINE_SECS")?
                .map(Duration::from_secs),
            call_timeout: Duration::from_secs(parse_or(
                &var,
                "RSM_CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )?),
            backoff,
            rate_limit_cooldown: Duration::from_secs(parse_or(
                &var,
                "RSM_RATE_LIMIT_COOLDOWN_SECS",
                defaults.rate_limit_cooldown.as_secs(),
            )?),
            max_rate_limit_pause: Duration::from_secs(parse_or(
                &var,
                "RSM_MAX_RATE_LIMIT_PAUSE_SECS",
                defaults.max_rate_limit_pause.as_secs(),
            )?),
            limit: parse_or(&var, "RSM_SCORE_LIMIT", defaults.limit)?,
        };

        let config = Self {
            database_path,
            lock_path,
            reports_dir,
            source,
            sources_file: var("RSM_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            fixture_path: var("RSM_FIXTURE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fixtures/items.json")),
            max_pages: parse_opt(&var, "RSM_MAX_PAGES")?,
            page_size: parse_or(&var, "RSM_PAGE_SIZE", 100usize)?,
            scoring,
            continue_on_ingest_error: parse_bool(&var, "RSM_CONTINUE_ON_INGEST_ERROR", false)?,
            scheduler_enabled: parse_bool(&var, "RSM_SCHEDULER_ENABLED", false)?,
            sync_cron_1: var("RSM_SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: var("RSM_SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
            openai: OpenAiSettings {
                api_key: var("OPENAI_API_KEY"),
                model: var("OPENAI_MODEL")
                    .unwrap_or_else(|| OpenAiConfig::DEFAULT_MODEL.to_string()),
                base_url: var("OPENAI_BASE_URL")
                    .unwrap_or_else(|| OpenAiConfig::DEFAULT_BASE_URL.to_string()),
            },
            reddit: RedditSettings {
                client_id: var("REDDIT_CLIENT_ID"),
                client_secret: var("REDDIT_CLIENT_SECRET"),
                user_agent: var("REDDIT_USER_AGENT").unwrap_or_else(|| "rsm-bot/0.1".to_string()),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let at_least_one = |var: &'static str, value: u64| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    var,
                    value: value.to_string(),
                    reason: "must be at least 1".into(),
                })
            } else {
                Ok(())
            }
        };
        at_least_one("RSM_MAX_ATTEMPTS", u64::from(self.scoring.max_attempts))?;
        at_least_one("RSM_CONCURRENCY", self.scoring.concurrency as u64)?;
        at_least_one("RSM_PAGE_SIZE", self.page_size as u64)?;
        at_least_one("RSM_CALL_TIMEOUT_SECS", self.scoring.call_timeout.as_secs())?;
        at_least_one(
            "RSM_MAX_RATE_LIMIT_PAUSE_SECS",
            self.scoring.max_rate_limit_pause.as_secs(),
        )?;
        if let Some(pages) = self.max_pages {
            at_least_one("RSM_MAX_PAGES", pages as u64)?;
        }
        if self.scoring.rate.is_some_and(|rate| rate.refill_every.is_zero()) {
            return Err(ConfigError::Invalid {
                var: "RSM_RATE_INTERVAL_SECS",
                value: "0".into(),
                reason: "pacing needs a non-zero interval".into(),
            });
        }
        if self.scoring.backoff.base_delay > self.scoring.backoff.max_delay {
            return Err(ConfigError::Invalid {
                var: "RSM_BACKOFF_BASE_MS",
                value: self.scoring.backoff.base_delay.as_millis().to_string(),
                reason: "greater than RSM_BACKOFF_MAX_MS".into(),
            });
        }
        Ok(())
    }

    /// OpenAI settings with the API key resolved.
    pub fn openai_config(&self) -> Result<OpenAiConfig, ConfigError> {
        Ok(OpenAiConfig {
            api_key: self
                .openai
                .api_key
                .clone()
                .ok_or(ConfigError::MissingCredential("OPENAI_API_KEY"))?,
            model: self.openai.model.clone(),
            base_url: self.openai.base_url.clone(),
        })
    }

    /// Reddit settings merged with the subreddit registry.
    pub fn reddit_config(&self, sources: &SourcesFile) -> Result<RedditConfig, ConfigError> {
        Ok(RedditConfig {
            client_id: self
                .reddit
                .client_id
                .clone()
                .ok_or(ConfigError::MissingCredential("REDDIT_CLIENT_ID"))?,
            client_secret: self
                .reddit
                .client_secret
                .clone()
                .ok_or(ConfigError::MissingCredential("REDDIT_CLIENT_SECRET"))?,
            subreddits: sources.subreddits.clone(),
            listing: sources.listing,
            post_limit: sources.post_limit,
            max_comments_per_post: sources.max_comments_per_post,
            bot_usernames: sources.bot_usernames.clone(),
            page_size: self.page_size,
            auth_url: RedditConfig::DEFAULT_AUTH_URL.to_string(),
            api_base: RedditConfig::DEFAULT_API_BASE.to_string(),
        })
    }
}

/// Which subreddits to mine and how deep. A missing file means the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourcesFile {
    pub subreddits: Vec<String>,
    pub listing: Listing,
    pub post_limit: u32,
    pub max_comments_per_post: usize,
    pub bot_usernames: Vec<String>,
}

impl Default for SourcesFile {
    fn default() -> Self {
        Self {
            subreddits: vec![
                "stocks".to_string(),
                "investing".to_string(),
                "wallstreetbets".to_string(),
            ],
            listing: Listing::Hot,
            post_limit: 10,
            max_comments_per_post: 100,
            bot_usernames: vec!["AutoModerator".to_string()],
        }
    }
}

impl SourcesFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::SourcesFileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::SourcesFileParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn parse_opt<T, F>(var: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
                var: key,
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn parse_or<T, F>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(var, key)?.unwrap_or(default))
}

fn parse_bool<F>(var: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var: key,
                value: raw,
                reason: "expected a boolean".into(),
            }),
        },
    }
}
