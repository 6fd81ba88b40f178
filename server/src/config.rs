// Configuration for the assistant server

use std::str::FromStr;
use std::time::Duration;

use llm_core::{ChatClientConfig, WhisperConfig};
use speech_core::{OpenAiSpeechConfig, SegmenterConfig, SynthesisConfig, Voice};
use thiserror::Error;

use crate::orchestrator::PipelineConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ASSISTANT_VOICE: {0}")]
    InvalidVoice(#[from] speech_core::UnknownVoice),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Where finished clips go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOutput {
    /// Wait out each clip's duration without a device.
    Clock,
    /// The default output device. Needs the `device-audio` feature.
    Device,
}

impl FromStr for AudioOutput {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clock" => Ok(AudioOutput::Clock),
            "device" => Ok(AudioOutput::Device),
            other => Err(ConfigError::InvalidValue {
                key: "AUDIO_OUTPUT",
                message: format!("expected 'clock' or 'device', got '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub port: u16,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,

    pub chat_api_key: Option<String>,
    pub chat_base_url: String,
    pub chat_model: String,
    pub chat_max_tokens: u16,
    pub chat_temperature: f32,
    pub chat_timeout_secs: u64,

    pub speech_api_key: Option<String>,
    pub speech_base_url: String,
    pub speech_model: String,
    pub speech_speed: f32,
    pub transcribe_model: String,

    pub assistant_name: String,
    pub voice: Voice,
    pub min_unit_chars: usize,
    pub max_unit_chars: usize,
    pub split_long_clauses: bool,
    pub synthesis_concurrency: usize,
    pub synthesis_timeout_secs: u64,
    pub synthesis_cache_size: usize,
    pub history_max_messages: usize,
    pub history_context_messages: usize,
    pub speak_fallback: bool,
    pub audio_output: AudioOutput,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            chat_api_key: None,
            chat_base_url: "https://api.perplexity.ai".into(),
            chat_model: "sonar-pro".into(),
            chat_max_tokens: 200,
            chat_temperature: 0.3,
            chat_timeout_secs: 30,
            speech_api_key: None,
            speech_base_url: "https://api.openai.com/v1".into(),
            speech_model: "tts-1".into(),
            speech_speed: 1.15,
            transcribe_model: "whisper-1".into(),
            assistant_name: "Jarvis".into(),
            voice: Voice::Alloy,
            min_unit_chars: 10,
            max_unit_chars: 500,
            split_long_clauses: false,
            synthesis_concurrency: 3,
            synthesis_timeout_secs: 30,
            synthesis_cache_size: 64,
            history_max_messages: 20,
            history_context_messages: 10,
            speak_fallback: true,
            audio_output: AudioOutput::Clock,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_string(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

impl AssistantConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let openai_key = env_string("OPENAI_API_KEY");
        let voice = match env_string("ASSISTANT_VOICE") {
            Some(v) => v.parse::<Voice>()?,
            None => defaults.voice,
        };
        let audio_output = match env_string("AUDIO_OUTPUT") {
            Some(v) => v.parse()?,
            None => defaults.audio_output,
        };

        let cors_allowed_origins = env_string("CORS_ALLOWED_ORIGINS").map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        let config = Self {
            port: env_or("PORT", defaults.port),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,
            chat_api_key: env_string("CHAT_API_KEY").or_else(|| openai_key.clone()),
            chat_base_url: env_string("CHAT_BASE_URL").unwrap_or(defaults.chat_base_url),
            chat_model: env_string("CHAT_MODEL").unwrap_or(defaults.chat_model),
            chat_max_tokens: env_or("CHAT_MAX_TOKENS", defaults.chat_max_tokens),
            chat_temperature: env_or("CHAT_TEMPERATURE", defaults.chat_temperature),
            chat_timeout_secs: env_or("CHAT_TIMEOUT_SECS", defaults.chat_timeout_secs),
            speech_api_key: openai_key,
            speech_base_url: env_string("SPEECH_BASE_URL").unwrap_or(defaults.speech_base_url),
            speech_model: env_string("SPEECH_MODEL").unwrap_or(defaults.speech_model),
            speech_speed: env_or("SPEECH_SPEED", defaults.speech_speed),
            transcribe_model: env_string("TRANSCRIBE_MODEL").unwrap_or(defaults.transcribe_model),
            assistant_name: env_string("ASSISTANT_NAME").unwrap_or(defaults.assistant_name),
            voice,
            min_unit_chars: env_or("MIN_UNIT_CHARS", defaults.min_unit_chars),
            max_unit_chars: env_or("MAX_UNIT_CHARS", defaults.max_unit_chars),
            split_long_clauses: env_flag("SPLIT_LONG_CLAUSES", defaults.split_long_clauses),
            synthesis_concurrency: env_or(
                "SYNTHESIS_CONCURRENCY",
                defaults.synthesis_concurrency,
            )
            .clamp(1, 8),
            synthesis_timeout_secs: env_or(
                "SYNTHESIS_TIMEOUT_SECS",
                defaults.synthesis_timeout_secs,
            ),
            synthesis_cache_size: env_or("SYNTHESIS_CACHE_SIZE", defaults.synthesis_cache_size),
            history_max_messages: env_or("HISTORY_MAX_MESSAGES", defaults.history_max_messages),
            history_context_messages: env_or(
                "HISTORY_CONTEXT_MESSAGES",
                defaults.history_context_messages,
            ),
            speak_fallback: env_flag("SPEAK_FALLBACK", defaults.speak_fallback),
            audio_output,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_unit_chars == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_UNIT_CHARS",
                message: "must be greater than zero".into(),
            });
        }
        if !(0.25..=4.0).contains(&self.speech_speed) {
            return Err(ConfigError::InvalidValue {
                key: "SPEECH_SPEED",
                message: format!("{} is outside 0.25..=4.0", self.speech_speed),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    pub fn chat_client(&self) -> ChatClientConfig {
        ChatClientConfig {
            base_url: self.chat_base_url.clone(),
            api_key: self.chat_api_key.clone(),
            model: self.chat_model.clone(),
            max_tokens: self.chat_max_tokens,
            temperature: self.chat_temperature,
        }
    }

    pub fn speech_client(&self) -> OpenAiSpeechConfig {
        OpenAiSpeechConfig {
            base_url: self.speech_base_url.clone(),
            api_key: self.speech_api_key.clone(),
            model: self.speech_model.clone(),
            speed: self.speech_speed,
        }
    }

    pub fn whisper_client(&self) -> WhisperConfig {
        WhisperConfig {
            base_url: self.speech_base_url.clone(),
            api_key: self.speech_api_key.clone(),
            model: self.transcribe_model.clone(),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            assistant_name: self.assistant_name.clone(),
            default_voice: self.voice,
            segmenter: SegmenterConfig {
                min_unit_chars: self.min_unit_chars,
                split_long_clauses: self.split_long_clauses,
            },
            max_unit_chars: self.max_unit_chars,
            synthesis: SynthesisConfig {
                max_in_flight: self.synthesis_concurrency,
                timeout: self.synthesis_timeout(),
                cache_size: self.synthesis_cache_size,
            },
            chat_timeout: self.chat_timeout(),
            history_max_messages: self.history_max_messages,
            history_context_messages: self.history_context_messages,
            speak_fallback: self.speak_fallback,
        }
    }
}
