//! OpenAI-compatible LLM API client.
//!
//! Provides typed request/response structures, the raw [`LlmClient`], and
//! [`ChatModel`], which pins a model id and sampling settings so role
//! implementations can simply ask for a completion. Each completion made
//! through a [`ChatModel`] is recorded in its [`UsageLog`].

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::usage::{CallTag, LlmCallRecord, UsageLog};
use crate::config::ModelConfig;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author: `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A single completion choice returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    /// The reason the model stopped generating (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// Token usage statistics for a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// A chat completion response from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub choices: Vec<Choice>,
    /// Some local servers omit usage; it then reads as zero.
    #[serde(default)]
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct LlmClient {
    /// The base URL for API requests (e.g. `"https://api.openai.com/v1"`).
    pub api_base: String,
    /// The API key used for bearer authentication.
    pub api_key: String,
    pub http: reqwest::Client,
}

impl LlmClient {
    /// Create a new client pointing at `base_url` (e.g. `"https://api.openai.com/v1"`).
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        }
    }

    /// Send a chat completion request and return the parsed response.
    ///
    /// Calls `POST {base_url}/chat/completions`.
    pub async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: usize,
    ) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(model, temperature, max_tokens, "sending chat completion request");

        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to send chat completion request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat completion API returned {status}: {text}");
        }

        let chat_response: ChatResponse = resp
            .json()
            .await
            .context("failed to parse chat completion response")?;

        debug!(
            model,
            prompt_tokens = chat_response.usage.prompt_tokens,
            completion_tokens = chat_response.usage.completion_tokens,
            "chat completion succeeded"
        );

        Ok(chat_response)
    }
}

// ---------------------------------------------------------------------------
// Pinned model
// ---------------------------------------------------------------------------

/// A chat client bound to one model and sampling configuration.
#[derive(Debug, Clone)]
pub struct ChatModel {
    client: LlmClient,
    model_id: String,
    temperature: f64,
    max_tokens: usize,
    usage: UsageLog,
}

impl ChatModel {
    pub fn new(client: LlmClient, model_id: &str, temperature: f64, max_tokens: usize) -> Self {
        Self {
            client,
            model_id: model_id.to_string(),
            temperature,
            max_tokens,
            usage: UsageLog::default(),
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(
            LlmClient::new(&config.api_base, &config.api_key),
            &config.model_id,
            config.temperature,
            config.max_tokens,
        )
    }

    /// Record every completion in `usage`.
    pub fn with_usage_log(mut self, usage: UsageLog) -> Self {
        self.usage = usage;
        self
    }

    /// Return the text of the first choice.
    ///
    /// The call is logged under `tag` before the reply is inspected. A
    /// response without choices is an error, not an empty string.
    pub async fn complete(&self, messages: &[ChatMessage], tag: CallTag<'_>) -> Result<String> {
        let started = Instant::now();
        let resp = self
            .client
            .chat_completion(&self.model_id, messages, self.temperature, self.max_tokens)
            .await?;
        let record = LlmCallRecord::new(
            tag,
            &self.model_id,
            &resp.usage,
            started.elapsed().as_secs_f64(),
        );
        self.usage.record(&record);
        debug!(
            role = tag.role,
            task_id = tag.task_id,
            step = ?tag.step,
            total_tokens = record.total_tokens,
            "LLM call recorded"
        );
        first_choice_text(resp)
    }
}

fn first_choice_text(resp: ChatResponse) -> Result<String> {
    resp.choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .with_context(|| format!("chat completion {} returned no choices", resp.id))
}
