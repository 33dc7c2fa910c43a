//! OpenAI chat-completions sentiment scorer.

use std::sync::Arc;

use async_trait::async_trait;
use rsm_core::{default_disposition, Disposition, ScoreError, Sentiment, SentimentLabel};
use rsm_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::SentimentScorer;

const SYSTEM_PROMPT: &str = "You classify the sentiment of Reddit comments about stocks \
and markets. Reply with a JSON object {\"label\": \"positive\"|\"neutral\"|\"negative\", \
\"confidence\": number between 0 and 1}. Bullish means positive, bearish means negative.";

/// Texts beyond this many characters are cut before being sent.
const MAX_INPUT_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl OpenAiConfig {
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";
}

#[derive(Debug)]
pub struct OpenAiScorer {
    config: OpenAiConfig,
    http: Arc<HttpFetcher>,
}

impl OpenAiScorer {
    pub fn new(config: OpenAiConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentimentPayload {
    label: String,
    confidence: f64,
}

#[async_trait]
impl SentimentScorer for OpenAiScorer {
    fn model(&self) -> Option<&str> {
        Some(&self.config.model)
    }

    async fn score(&self, text: &str) -> Result<Sentiment, ScoreError> {
        let input: String = text.chars().take(MAX_INPUT_CHARS).collect();
        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": input },
            ],
        });
        let request = self
            .http
            .client()
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body);

        let resp = self.http.send_once(request).await.map_err(map_fetch_error)?;
        let chat: ChatResponse = resp
            .json()
            .map_err(|err| ScoreError::Permanent(format!("unexpected completion body: {err}")))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ScoreError::Permanent("completion without content".into()))?;
        debug!(model = %self.config.model, "completion received");
        parse_sentiment_content(&content)
    }

    fn classify(&self, err: &ScoreError) -> Disposition {
        match err {
            ScoreError::RateLimited { message, .. } if message.contains("insufficient_quota") => {
                Disposition::Abort
            }
            other => default_disposition(other),
        }
    }
}

/// Parse the model's JSON reply. Code fences around the object are tolerated.
pub fn parse_sentiment_content(content: &str) -> Result<Sentiment, ScoreError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let payload: SentimentPayload = serde_json::from_str(trimmed)
        .map_err(|err| ScoreError::Permanent(format!("unparseable sentiment {trimmed:?}: {err}")))?;
    let label = SentimentLabel::parse(&payload.label).ok_or_else(|| {
        ScoreError::Permanent(format!("unknown sentiment label {:?}", payload.label))
    })?;
    Sentiment::new(label, payload.confidence).ok_or_else(|| {
        ScoreError::Permanent(format!("confidence {} outside [0, 1]", payload.confidence))
    })
}

fn map_fetch_error(err: FetchError) -> ScoreError {
    match err {
        FetchError::HttpStatus {
            status,
            retry_after,
            body,
            ..
        } => match status {
            429 => ScoreError::RateLimited {
                retry_after,
                message: body,
            },
            401 | 403 => ScoreError::Auth(format!("http {status}: {body}")),
            408 | 409 | 500..=599 => ScoreError::Transient(format!("http {status}: {body}")),
            _ => ScoreError::Permanent(format!("http {status}: {body}")),
        },
        FetchError::Request(err) if err.is_builder() => ScoreError::Permanent(err.to_string()),
        FetchError::Request(err) => ScoreError::Transient(err.to_string()),
    }
}
