use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("no API key configured")]
    MissingApiKey,

    #[error("unsupported audio format '{0}' (expected m4a, mp3 or wav)")]
    UnsupportedFormat(String),
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        LlmError::Decode(e.to_string())
    }
}
