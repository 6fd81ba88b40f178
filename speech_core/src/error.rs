use std::time::Duration;

use thiserror::Error;

/// Why a single unit produced no audio.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("synthesis service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),

    #[error("synthesis cancelled")]
    Cancelled,

    #[error("synthesis returned no audio")]
    EmptyAudio,

    #[error("synthesis backend error: {0}")]
    Backend(String),
}

/// Failure of the active buffer. The queue treats it as a completion.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("could not decode clip: {0}")]
    Decode(String),

    #[error("audio device error: {0}")]
    Device(String),
}

impl From<hound::Error> for PlaybackError {
    fn from(e: hound::Error) -> Self {
        PlaybackError::Decode(e.to_string())
    }
}
