//! Thin client for the chat-completion endpoint.
//!
//! The planner logic sits above the [`CompletionClient`] seam; this module
//! only knows how to move one (system, user) prompt pair to the endpoint and
//! bring the assistant content back.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const TEMPERATURE: f64 = 0.2;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Abstraction over the completion endpoint.
pub trait CompletionClient: Send + Sync {
    fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("OPENAI_API_KEY is not set")]
    AuthMissing,
    /// The endpoint answered with an error. Carries the upstream message
    /// when one was present, else a generic status description.
    #[error("{0}")]
    Upstream(String),
    #[error("completion request failed: {0}")]
    Transport(String),
    #[error("completion response was malformed: {0}")]
    Malformed(String),
}

/// Blocking OpenAI chat-completions client.
pub struct OpenAiCompletion {
    api_key: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OpenAiCompletion {
    /// Build a client from `OPENAI_API_KEY`. An absent or blank key is
    /// refused here so the failure surfaces before any prompt assembly.
    pub fn from_env(model: &str) -> Result<Self, CompletionError> {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(CompletionError::AuthMissing);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| CompletionError::Transport(err.to_string()))?;
        Ok(Self {
            api_key,
            model: model.to_string(),
            client,
        })
    }
}

impl CompletionClient for OpenAiCompletion {
    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError> {
        let request = ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let response = self
            .client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|err| CompletionError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| CompletionError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(CompletionError::Upstream(upstream_message(
                status.as_u16(),
                &body,
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|err| CompletionError::Malformed(err.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.into_text())
            .ok_or_else(|| CompletionError::Malformed("response had no choices".to_string()))?;
        debug!(content_len = content.len(), "completion received");
        Ok(content)
    }
}

/// Upstream error body → surfaced message. Most providers answer
/// `{"error": {"message": "..."}}`; anything else degrades to the status.
pub fn upstream_message(status: u16, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("upstream error (status {status})"))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f64,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: MessageContent,
}

/// Assistant content: either a plain string or an array of text parts,
/// concatenated in order.
#[derive(Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    fn into_text(self) -> String {
        match self {
            MessageContent::Text(text) => text,
            MessageContent::Parts(parts) => parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}
