//! Events pushed to UI subscribers.
use serde::Serialize;
use speech_core::{SessionId, UnitId};

use crate::state::PipelineState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UiEvent {
    PartialTranscript {
        text: String,
    },
    SentenceReady {
        session_id: SessionId,
        unit_id: UnitId,
        text: String,
    },
    PlaybackStarted {
        session_id: SessionId,
        unit_id: UnitId,
    },
    SessionDone {
        session_id: SessionId,
    },
    SessionError {
        session_id: SessionId,
        cause: String,
    },
    StateChanged {
        state: PipelineState,
        session_id: Option<SessionId>,
    },
}

impl UiEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            UiEvent::PartialTranscript { .. } => None,
            UiEvent::SentenceReady { session_id, .. }
            | UiEvent::PlaybackStarted { session_id, .. }
            | UiEvent::SessionDone { session_id }
            | UiEvent::SessionError { session_id, .. } => Some(*session_id),
            UiEvent::StateChanged { session_id, .. } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let id = SessionId::new();
        let json = serde_json::to_value(UiEvent::SentenceReady {
            session_id: id,
            unit_id: 2,
            text: "Hello there.".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "sentenceReady");
        assert_eq!(json["unit_id"], 2);
        assert_eq!(json["session_id"], id.to_string());

        let json = serde_json::to_value(UiEvent::StateChanged {
            state: PipelineState::Streaming,
            session_id: None,
        })
        .unwrap();
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["state"], "streaming");
    }
}
