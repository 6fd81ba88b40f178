use speech_core::{SessionId, Voice};

use crate::error::ApiError;

/// Maximum transcript length accepted for a session
const MAX_TRANSCRIPT_LENGTH: usize = 4000;

/// Validate a transcript submitted to start a session
pub fn validate_transcript(text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Transcript cannot be empty".to_string()));
    }
    if text.chars().count() > MAX_TRANSCRIPT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Transcript too long (max {} characters)",
            MAX_TRANSCRIPT_LENGTH
        )));
    }
    Ok(())
}

/// Parse a session id path segment
pub fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::InvalidInput(format!("Invalid session id: {}", raw)))
}

/// Parse an optional voice override, rejecting unknown names
pub fn parse_voice(raw: Option<&str>) -> Result<Option<Voice>, ApiError> {
    raw.map(|v| v.parse::<Voice>().map_err(|e| ApiError::InvalidInput(e.to_string())))
        .transpose()
}
