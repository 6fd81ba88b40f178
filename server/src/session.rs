//! One utterance-to-response lifecycle.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use speech_core::{SessionId, UnitId, Voice, FIRST_UNIT_ID};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Shared between the orchestrator and the session's own task.
///
/// The cancellation token is the only cancellation signal; every stage
/// checks it rather than inferring cancellation from other state.
#[derive(Debug)]
pub struct PipelineSession {
    pub id: SessionId,
    pub transcript: String,
    pub voice: Voice,
    pub started_at: Instant,
    cancel: CancellationToken,
    next_unit: AtomicU64,
    audio_started: AtomicBool,
}

impl PipelineSession {
    pub fn new(transcript: impl Into<String>, voice: Voice) -> Self {
        Self {
            id: SessionId::new(),
            transcript: transcript.into(),
            voice,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            next_unit: AtomicU64::new(FIRST_UNIT_ID),
            audio_started: AtomicBool::new(false),
        }
    }

    /// Ids are handed out once each, in increasing order.
    pub fn next_unit_id(&self) -> UnitId {
        self.next_unit.fetch_add(1, Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true the first time it is called.
    pub fn mark_audio_started(&self) -> bool {
        !self.audio_started.swap(true, Ordering::Relaxed)
    }

    pub fn audio_started(&self) -> bool {
        self.audio_started.load(Ordering::Relaxed)
    }
}
