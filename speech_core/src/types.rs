use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SynthesisError;
use crate::voice::Voice;

/// Unit ids start here and grow by one per emitted unit within a session.
pub const FIRST_UNIT_ID: UnitId = 1;

pub type UnitId = u64;

/// Identifies one utterance-to-response lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A span of response text judged ready for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakableUnit {
    pub id: UnitId,
    pub session_id: SessionId,
    pub text: String,
}

/// Encoded audio for one unit (WAV container).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Bytes,
}

impl AudioClip {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }
}

/// What is sent to the synthesis collaborator for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizeRequest {
    pub session_id: SessionId,
    pub unit_id: UnitId,
    pub text: String,
    pub voice: Voice,
}

/// Completion of one synthesis call, success or failure, tagged with its unit.
#[derive(Debug)]
pub struct SynthesisResult {
    pub unit_id: UnitId,
    pub session_id: SessionId,
    pub outcome: Result<AudioClip, SynthesisError>,
    pub elapsed: Duration,
    pub cache_hit: bool,
}

impl SynthesisResult {
    pub fn failed(session_id: SessionId, unit_id: UnitId, error: SynthesisError) -> Self {
        Self {
            unit_id,
            session_id,
            outcome: Err(error),
            elapsed: Duration::ZERO,
            cache_hit: false,
        }
    }
}
