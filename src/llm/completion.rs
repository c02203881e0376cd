//! Completion client adapter: request building, the provider call, and the
//! mapping of provider failures to user-facing apologies.

use crate::config::CompletionConfig;
use crate::error::CompletionError;
use crate::store::{AIAssistant, ConversationStore, HistoryEntry, Role};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Body of an OpenAI-style `/chat/completions` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: ChatContent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// The external chat-completion RPC.
#[async_trait]
pub trait CompletionApi: Send + Sync + 'static {
    /// Run one completion and return the reply text.
    async fn create(&self, request: &ChatRequest) -> Result<String, CompletionError>;
}

/// Client for OpenAI-compatible chat-completion endpoints.
pub struct OpenAiClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &CompletionConfig, api_key: impl Into<String>) -> crate::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

#[async_trait]
impl CompletionApi for OpenAiClient {
    async fn create(&self, request: &ChatRequest) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let response_text = response.text().await.map_err(|error| {
            CompletionError::ConnectionFailure(format!("failed to read response body: {error}"))
        })?;

        let response_body: serde_json::Value = match serde_json::from_str(&response_text) {
            Ok(body) => body,
            Err(error) if status.is_success() => {
                return Err(CompletionError::Other(format!(
                    "response ({status}) is not valid JSON: {error}"
                )));
            }
            Err(_) => serde_json::Value::Null,
        };

        if !status.is_success() {
            let message = response_body["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            return Err(classify_status(status.as_u16(), message));
        }

        response_body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CompletionError::Other("response has no message content".into()))
    }
}

fn classify_transport_error(error: reqwest::Error) -> CompletionError {
    if error.is_connect() || error.is_timeout() {
        CompletionError::ConnectionFailure(error.to_string())
    } else {
        CompletionError::Other(error.to_string())
    }
}

/// Map a non-success HTTP status to a failure kind.
pub fn classify_status(status: u16, message: &str) -> CompletionError {
    let detail = format!("({status}) {message}");
    match status {
        401 | 403 => CompletionError::AuthFailure(detail),
        429 => CompletionError::RateLimited(detail),
        502..=504 => CompletionError::ConnectionFailure(detail),
        _ => CompletionError::Other(detail),
    }
}

/// Fixed end-user text for each failure kind. Provider details never reach
/// the chat.
pub fn apology_for(error: &CompletionError) -> &'static str {
    match error {
        CompletionError::AuthFailure(_) => "⚠️ Bot configuration error. Please contact support.",
        CompletionError::RateLimited(_) => {
            "⏳ I'm getting too many requests. Please try again later."
        }
        CompletionError::ConnectionFailure(_) => "🔌 Connection error. Please try again.",
        CompletionError::Other(_) => {
            "⚠️ I encountered an error processing your request. Please try again."
        }
    }
}

/// Result of one completion attempt, ready to be sent to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// Assistant reply. The only outcome persisted as an outgoing message.
    Reply(String),
    Apology {
        error: CompletionError,
        text: &'static str,
    },
}

impl CompletionOutcome {
    pub fn text(&self) -> &str {
        match self {
            CompletionOutcome::Reply(text) => text,
            CompletionOutcome::Apology { text, .. } => text,
        }
    }
}

/// Builds completion requests for an assistant and runs them.
#[derive(Clone)]
pub struct Completer {
    api: Arc<dyn CompletionApi>,
    store: Arc<dyn ConversationStore>,
}

impl Completer {
    pub fn new(api: Arc<dyn CompletionApi>, store: Arc<dyn ConversationStore>) -> Self {
        Self { api, store }
    }

    /// Ordered message list: instructions, stored history, then the current
    /// user turn with an optional image part.
    pub fn build_request(
        assistant: &AIAssistant,
        text: &str,
        image_ref: Option<&str>,
        history: &[HistoryEntry],
    ) -> ChatRequest {
        let mut messages = Vec::with_capacity(history.len() + 2);

        if !assistant.instructions.trim().is_empty() {
            messages.push(ChatMessage {
                role: Role::System,
                content: ChatContent::Text(assistant.instructions.clone()),
            });
        }

        messages.extend(history.iter().map(|entry| ChatMessage {
            role: entry.role,
            content: ChatContent::Text(entry.content.clone()),
        }));

        let mut parts = vec![ContentPart::Text {
            text: text.to_string(),
        }];
        if let Some(url) = image_ref {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: url.to_string(),
                },
            });
        }
        messages.push(ChatMessage {
            role: Role::User,
            content: ChatContent::Parts(parts),
        });

        ChatRequest {
            model: assistant.model.clone(),
            messages,
            temperature: assistant.config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: assistant.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }

    /// Run a completion for `assistant`. Never fails: provider errors become
    /// an apology outcome and are logged for operators.
    pub async fn complete(
        &self,
        assistant: &AIAssistant,
        text: &str,
        image_ref: Option<&str>,
        history: &[HistoryEntry],
    ) -> CompletionOutcome {
        let request = Self::build_request(assistant, text, image_ref, history);

        if let Err(error) = self.store.touch_assistant(assistant.id).await {
            tracing::warn!(assistant_id = assistant.id, %error, "failed to record assistant usage");
        }

        match self.api.create(&request).await {
            Ok(reply) => {
                tracing::debug!(
                    assistant_id = assistant.id,
                    model = %assistant.model,
                    reply_len = reply.len(),
                    "completion succeeded"
                );
                CompletionOutcome::Reply(reply)
            }
            Err(error) => {
                tracing::error!(
                    assistant_id = assistant.id,
                    model = %assistant.model,
                    %error,
                    "completion failed"
                );
                CompletionOutcome::Apology {
                    text: apology_for(&error),
                    error,
                }
            }
        }
    }
}
