//! Streaming chat completions over an OpenAI-compatible API.
use std::pin::Pin;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::sse::SseLineParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// What a response stream yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A fragment of response text, in arrival order.
    Delta(String),
    /// The model finished normally.
    Finish,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ChatEvent, LlmError>> + Send>>;

/// Source of streamed responses.
#[async_trait]
pub trait ChatStream: Send + Sync {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<DeltaStream, LlmError>;
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u16,
    pub temperature: f32,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.perplexity.ai".into(),
            api_key: None,
            model: "sonar-pro".into(),
            max_tokens: 200,
            temperature: 0.3,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u16,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Client for `POST {base}/chat/completions` with `stream: true`.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    config: ChatClientConfig,
}

impl OpenAiChatClient {
    pub fn new(config: ChatClientConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ChatStream for OpenAiChatClient {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<DeltaStream, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey)?;
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages: &messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: true,
        };

        debug!(model = %self.config.model, messages = messages.len(), "opening chat stream");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(chat_events(response.bytes_stream())))
    }
}

/// Turn an SSE body into chat events. Ends at `[DONE]` or end of body.
fn chat_events(
    body: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<ChatEvent, LlmError>> + Send + 'static {
    let mut body = Box::pin(body);
    try_stream! {
        let mut parser = SseLineParser::new();
        let mut done = false;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for event in parser.push(&chunk) {
                if event.is_done() {
                    done = true;
                    break;
                }
                if let Some(text) = delta_text(&event.data) {
                    yield ChatEvent::Delta(text);
                }
            }
            if done {
                break;
            }
        }
        if !done {
            let tail = parser
                .flush()
                .filter(|event| !event.is_done())
                .and_then(|event| delta_text(&event.data));
            if let Some(text) = tail {
                yield ChatEvent::Delta(text);
            }
        }
        yield ChatEvent::Finish;
    }
}

/// Text carried by one stream chunk. Malformed chunks are logged and skipped.
fn delta_text(data: &str) -> Option<String> {
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("skipping malformed stream chunk: {e}");
            return None;
        }
    };
    chunk
        .choices
        .into_iter()
        .next()?
        .delta?
        .content
        .filter(|text| !text.is_empty())
}
