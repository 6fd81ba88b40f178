//! Scripted collaborators and helpers shared by the integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use llm_core::{ChatEvent, ChatMessage, ChatStream, DeltaStream, LlmError, Recording, Transcriber};
use server::config::AssistantConfig;
use server::events::UiEvent;
use server::{router, AppState, Collaborators, Orchestrator, PipelineConfig};
use speech_core::{ClockSink, SynthesisError, Synthesizer, Voice};
use tokio::sync::broadcast;

/// Sample rate of every fake clip. Low so long clips stay small.
pub const CLIP_RATE: u32 = 1_000;

/// One step of a scripted response stream.
pub struct Step {
    delay: Duration,
    event: Result<ChatEvent, LlmError>,
}

pub fn delta(text: &str) -> Step {
    Step {
        delay: Duration::ZERO,
        event: Ok(ChatEvent::Delta(text.to_string())),
    }
}

pub fn delta_after(delay: Duration, text: &str) -> Step {
    Step {
        delay,
        event: Ok(ChatEvent::Delta(text.to_string())),
    }
}

pub fn fail_after(delay: Duration, message: &str) -> Step {
    Step {
        delay,
        event: Err(LlmError::Decode(message.to_string())),
    }
}

/// Chat backend that replays one script per request and records what it was sent.
#[derive(Default)]
pub struct FakeChat {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeChat {
    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn push_reply(&self, text: &str) {
        self.push_script(vec![delta(text)]);
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatStream for FakeChat {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<DeltaStream, LlmError> {
        self.requests.lock().unwrap().push(messages);
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![delta("Okay.")]);
        let stream = futures_util::stream::iter(steps).then(|step| async move {
            tokio::time::sleep(step.delay).await;
            step.event
        });
        Ok(Box::pin(stream))
    }
}

/// How the fake synthesizer treats text containing `needle`.
#[derive(Clone)]
struct Rule {
    needle: String,
    delay: Duration,
    clip: Duration,
    fail: bool,
}

/// Synthesizer returning silent clips, with per-text latency and length.
pub struct FakeSynth {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    default_clip: Duration,
}

impl Default for FakeSynth {
    fn default() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            default_clip: Duration::from_secs(1),
        }
    }
}

impl FakeSynth {
    pub fn rule(&self, needle: &str, delay: Duration, clip: Duration) {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            delay,
            clip,
            fail: false,
        });
    }

    pub fn failing(&self, needle: &str) {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            delay: Duration::ZERO,
            clip: Duration::ZERO,
            fail: true,
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    async fn synthesize(&self, text: &str, _voice: Voice) -> Result<Bytes, SynthesisError> {
        self.calls.lock().unwrap().push(text.to_string());
        let rule = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|r| text.contains(&r.needle))
            .cloned();
        let (delay, clip, fail) = match rule {
            Some(r) => (r.delay, r.clip, r.fail),
            None => (Duration::ZERO, self.default_clip, false),
        };
        tokio::time::sleep(delay).await;
        if fail {
            return Err(SynthesisError::Backend(format!("cannot say '{text}'")));
        }
        let wav = speech_core::wav::silence(clip, CLIP_RATE)
            .map_err(|e| SynthesisError::Backend(e.to_string()))?;
        Ok(Bytes::from(wav))
    }
}

/// Transcriber returning a fixed answer.
pub struct FakeTranscriber {
    pub text: Mutex<Result<String, String>>,
}

impl FakeTranscriber {
    pub fn hearing(text: &str) -> Self {
        Self {
            text: Mutex::new(Ok(text.to_string())),
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _recording: Recording) -> Result<String, LlmError> {
        self.text
            .lock()
            .unwrap()
            .clone()
            .map_err(|body| LlmError::Status { status: 500, body })
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub chat: Arc<FakeChat>,
    pub synth: Arc<FakeSynth>,
    pub transcriber: Arc<FakeTranscriber>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let chat = Arc::new(FakeChat::default());
        let synth = Arc::new(FakeSynth::default());
        let transcriber = Arc::new(FakeTranscriber::hearing("What time is it?"));
        let orchestrator = Orchestrator::new(
            config,
            Collaborators {
                chat: chat.clone(),
                transcriber: transcriber.clone(),
                synthesizer: synth.clone(),
                sink: Arc::new(ClockSink),
            },
        );
        Self {
            orchestrator,
            chat,
            synth,
            transcriber,
        }
    }

    pub fn app(&self) -> Router {
        router(AppState {
            orchestrator: self.orchestrator.clone(),
            config: Arc::new(AssistantConfig::default()),
        })
    }
}

/// Create a test app backed by scripted collaborators
pub fn create_test_app() -> Router {
    Harness::new().app()
}

/// Receive events until `stop` matches one, returning everything seen.
pub async fn events_until(
    rx: &mut broadcast::Receiver<UiEvent>,
    stop: impl Fn(&UiEvent) -> bool,
) -> Vec<UiEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = stop(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Drain whatever is already buffered.
pub fn buffered_events(rx: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn played_units(events: &[UiEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            UiEvent::PlaybackStarted { unit_id, .. } => Some(*unit_id),
            _ => None,
        })
        .collect()
}
