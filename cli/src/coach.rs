//! Client for an OpenAI-compatible `/chat/completions` endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nourish_core::coach::ChatMessage;

use crate::config::CoachSettings;
use crate::retry::{RetryPolicy, Retryable};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_TOKENS: u32 = 400;

#[derive(Debug, Error)]
pub enum CoachError {
    #[error("Coach request timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("Coach API error: status {0}")]
    HttpStatus(u16),
    #[error("Coach returned an empty reply")]
    EmptyReply,
    #[error("Invalid coach response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for CoachError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e)
        }
    }
}

impl Retryable for CoachError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::HttpStatus(status) => *status >= 500 || *status == 429,
            Self::EmptyReply | Self::Decode(_) => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct CoachClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    policy: RetryPolicy,
}

impl CoachClient {
    /// `None` when no base URL is configured; callers fall back to the canned summary.
    pub fn from_settings(settings: &CoachSettings) -> Result<Option<Self>, CoachError> {
        let Some(base_url) = settings.base_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .user_agent(format!("nourish/{}", env!("CARGO_PKG_VERSION")))
            .timeout(COMPLETION_TIMEOUT)
            .build()?;
        Ok(Some(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            policy: RetryPolicy::default(),
        }))
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<String, CoachError> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: 0.7,
            max_tokens: MAX_TOKENS,
        };
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoachError::HttpStatus(status.as_u16()));
        }
        let parsed: CompletionResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(CoachError::EmptyReply)
    }

    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CoachError> {
        let reply = self
            .policy
            .run("coach completion", || self.complete_once(messages))
            .await?;
        tracing::debug!(model = %self.model, chars = reply.len(), "coach reply received");
        Ok(reply)
    }
}
