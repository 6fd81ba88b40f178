//! Speech-to-text for captured utterances.
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use crate::error::LlmError;

/// Container formats the transcription service accepts from us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    M4a,
    Mp3,
    Wav,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::M4a => "m4a",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            AudioFormat::M4a => "audio/m4a",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
        }
    }

    /// Map a `Content-Type` header value, ignoring parameters.
    pub fn from_content_type(content_type: &str) -> Result<Self, LlmError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "audio/m4a" | "audio/x-m4a" | "audio/mp4" => Ok(AudioFormat::M4a),
            "audio/mpeg" | "audio/mp3" => Ok(AudioFormat::Mp3),
            "audio/wav" | "audio/x-wav" | "audio/wave" => Ok(AudioFormat::Wav),
            _ => Err(LlmError::UnsupportedFormat(content_type.to_string())),
        }
    }
}

impl FromStr for AudioFormat {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "m4a" => Ok(AudioFormat::M4a),
            "mp3" => Ok(AudioFormat::Mp3),
            "wav" => Ok(AudioFormat::Wav),
            _ => Err(LlmError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// One captured utterance.
#[derive(Debug, Clone)]
pub struct Recording {
    pub bytes: Bytes,
    pub format: AudioFormat,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, recording: Recording) -> Result<String, LlmError>;
}

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "whisper-1".into(),
        }
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// OpenAI `/audio/transcriptions` client.
pub struct WhisperClient {
    client: reqwest::Client,
    config: WhisperConfig,
}

impl WhisperClient {
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(&self, recording: Recording) -> Result<String, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey)?;
        let url = format!(
            "{}/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        );

        let file = Part::bytes(recording.bytes.to_vec())
            .file_name(format!("recording.{}", recording.format.extension()))
            .mime_str(recording.format.mime())?;
        let form = Form::new()
            .text("model", self.config.model.clone())
            .part("file", file);

        debug!(bytes = recording.bytes.len(), format = ?recording.format, "transcribing");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .multipart(form)
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

        let body: TranscriptionResponse = response.json().await?;
        Ok(body.text.trim().to_string())
    }
}
