//! Lifecycle of the assistant as a pure state machine.
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Listening,
    Transcribing,
    Streaming,
    Cancelling,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    CaptureStart,
    CaptureStop,
    TranscriptReady,
    TranscriptFailed,
    /// End of stream and the queue advanced past the final unit.
    Drained,
    /// The session failed as a whole.
    Failed,
    /// The failure has been reported.
    Settle,
    Interrupt,
    CancelComplete,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {trigger:?} while {state:?}")]
pub struct InvalidTransition {
    pub state: PipelineState,
    pub trigger: Trigger,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: PipelineState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
        }
    }
}

impl StateMachine {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether `trigger` is legal from the current state.
    pub fn can(&self, trigger: Trigger) -> bool {
        next_state(self.state, trigger).is_some()
    }

    pub fn apply(&mut self, trigger: Trigger) -> Result<PipelineState, InvalidTransition> {
        let next = next_state(self.state, trigger).ok_or(InvalidTransition {
            state: self.state,
            trigger,
        })?;
        self.state = next;
        Ok(next)
    }
}

fn next_state(from: PipelineState, trigger: Trigger) -> Option<PipelineState> {
    use PipelineState::*;
    use Trigger::*;

    let to = match (from, trigger) {
        (_, Interrupt) => Cancelling,
        (Cancelling, CancelComplete) => Idle,
        (Idle | Done | Cancelling, CaptureStart) => Listening,
        (Listening, CaptureStop) => Transcribing,
        (Transcribing, TranscriptFailed) => Idle,
        (Idle | Done | Transcribing, TranscriptReady) => Streaming,
        (Streaming, Drained) => Done,
        (Streaming, Failed) => Error,
        (Error, Settle) => Done,
        _ => return None,
    };
    Some(to)
}
