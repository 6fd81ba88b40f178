//! Session lifecycle and the streaming response-to-speech pipeline.
//!
//! The [`Orchestrator`] is the only place a session is started or cancelled.
//! Each session runs in its own task: response deltas are segmented into
//! units, each unit is normalized and synthesized concurrently, and results
//! are handed to the playback actor which plays them strictly in unit order.
//! Starting a new session always finishes tearing down the previous one first.
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use llm_core::{system_prompt, ChatEvent, ChatMemory, ChatStream, LlmError, Recording, Transcriber};
use serde::Serialize;
use speech_core::{
    remove_citations, AudioPlayerController, AudioSink, Normalizer, PlaybackEvent,
    PlaybackHandle, SegmenterConfig, SentenceSegmenter, SessionId, SpeakableUnit,
    SynthesisClient, SynthesisConfig, SynthesizeRequest, Synthesizer, UnitId, Voice,
    FIRST_UNIT_ID,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::events::UiEvent;
use crate::metrics::PipelineMetrics;
use crate::session::PipelineSession;
use crate::state::{InvalidTransition, PipelineState, StateMachine, Trigger};

/// Shown, and optionally spoken, when a session fails before any audio.
pub const FALLBACK_REPLY: &str = "Sorry, I couldn't get a response. Please try again.";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub assistant_name: String,
    pub default_voice: Voice,
    pub segmenter: SegmenterConfig,
    pub max_unit_chars: usize,
    pub synthesis: SynthesisConfig,
    /// Bounds opening the chat stream, each wait for the next delta, and transcription.
    pub chat_timeout: Duration,
    pub history_max_messages: usize,
    pub history_context_messages: usize,
    pub speak_fallback: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Jarvis".into(),
            default_voice: Voice::Alloy,
            segmenter: SegmenterConfig::default(),
            max_unit_chars: speech_core::normalize::DEFAULT_MAX_UNIT_CHARS,
            synthesis: SynthesisConfig::default(),
            chat_timeout: Duration::from_secs(30),
            history_max_messages: llm_core::memory::DEFAULT_MAX_MESSAGES,
            history_context_messages: llm_core::memory::DEFAULT_CONTEXT_MESSAGES,
            speak_fallback: true,
        }
    }
}

/// The external services the pipeline talks to.
pub struct Collaborators {
    pub chat: Arc<dyn ChatStream>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Arc<dyn AudioSink>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("transcription failed: {0}")]
    Transcription(#[from] LlmError),

    #[error("nothing was heard in the recording")]
    EmptyTranscript,

    #[error("capture was interrupted before its transcript arrived")]
    Superseded,

    #[error("session {0} is not active")]
    UnknownSession(SessionId),
}

/// A session started from a recording.
#[derive(Debug, Clone, Serialize)]
pub struct StartedSession {
    pub session_id: SessionId,
    pub transcript: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state: PipelineState,
    pub session_id: Option<SessionId>,
    pub history_messages: usize,
}

/// How a session's task ended.
#[derive(Debug)]
enum SessionOutcome {
    Completed { reply: String },
    Failed { cause: String },
    Cancelled,
}

struct ActiveSession {
    session: Arc<PipelineSession>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    machine: StateMachine,
    active: Option<ActiveSession>,
    /// Bumped on every interruption so a transcript that lands late is dropped.
    capture_epoch: u64,
}

impl Control {
    fn owns(&self, session: SessionId) -> bool {
        self.active.as_ref().is_some_and(|a| a.session.id == session)
    }

    fn is_busy(&self) -> bool {
        self.active.is_some()
            || matches!(
                self.machine.state(),
                PipelineState::Listening | PipelineState::Transcribing
            )
    }
}

struct Inner {
    config: PipelineConfig,
    chat: Arc<dyn ChatStream>,
    transcriber: Arc<dyn Transcriber>,
    synthesis: SynthesisClient,
    playback: PlaybackHandle,
    normalizer: Normalizer,
    system_prompt: String,
    memory: Mutex<ChatMemory>,
    events: broadcast::Sender<UiEvent>,
    metrics: Arc<PipelineMetrics>,
    control: Mutex<Control>,
    current: Mutex<Option<Arc<PipelineSession>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Wire the pipeline and spawn the playback actor. Needs a tokio runtime.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let (playback_events, playback_rx) = mpsc::unbounded_channel();
        let (playback, _actor) = PlaybackHandle::spawn(
            AudioPlayerController::new(collaborators.sink),
            playback_events,
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            synthesis: SynthesisClient::new(collaborators.synthesizer, config.synthesis.clone()),
            normalizer: Normalizer::new(config.max_unit_chars),
            system_prompt: system_prompt(&config.assistant_name),
            memory: Mutex::new(ChatMemory::new(
                config.history_max_messages,
                config.history_context_messages,
            )),
            chat: collaborators.chat,
            transcriber: collaborators.transcriber,
            playback,
            events,
            metrics: Arc::new(PipelineMetrics::new()),
            control: Mutex::new(Control::default()),
            current: Mutex::new(None),
            config,
        });
        tokio::spawn(forward_playback_events(Arc::downgrade(&inner), playback_rx));

        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn default_voice(&self) -> Voice {
        self.inner.config.default_voice
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let history_messages = self.inner.memory.lock().await.len();
        let control = self.inner.control.lock().await;
        StateSnapshot {
            state: control.machine.state(),
            session_id: control.active.as_ref().map(|a| a.session.id),
            history_messages,
        }
    }

    /// The user started talking. Anything in progress is torn down first.
    pub async fn capture_started(&self) -> Result<(), PipelineError> {
        let mut control = self.inner.control.lock().await;
        if control.is_busy() {
            self.inner.interrupt_locked(&mut control).await;
        }
        self.inner.transition(&mut control, Trigger::CaptureStart, None)?;
        Ok(())
    }

    /// The user stopped talking (release or silence). Transcribes the
    /// recording and starts a session with the result.
    pub async fn capture_stopped(
        &self,
        recording: Recording,
    ) -> Result<StartedSession, PipelineError> {
        let epoch = {
            let mut control = self.inner.control.lock().await;
            self.inner.transition(&mut control, Trigger::CaptureStop, None)?;
            control.capture_epoch
        };

        let transcribed = match tokio::time::timeout(
            self.inner.config.chat_timeout,
            self.inner.transcriber.transcribe(recording),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout),
        };

        let mut control = self.inner.control.lock().await;
        if control.capture_epoch != epoch
            || control.machine.state() != PipelineState::Transcribing
        {
            debug!("dropping transcript from an interrupted capture");
            return Err(PipelineError::Superseded);
        }

        let transcript = match transcribed {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                self.inner.transition(&mut control, Trigger::TranscriptFailed, None)?;
                return Err(PipelineError::EmptyTranscript);
            }
            Err(e) => {
                warn!("transcription failed: {e}");
                self.inner.transition(&mut control, Trigger::TranscriptFailed, None)?;
                return Err(e.into());
            }
        };

        self.inner.emit(UiEvent::PartialTranscript {
            text: transcript.clone(),
        });
        let voice = self.inner.config.default_voice;
        let session_id = self
            .inner
            .launch_locked(&mut control, transcript.clone(), voice)
            .await?;
        Ok(StartedSession {
            session_id,
            transcript,
        })
    }

    /// Start a session from a transcript. Any previous session is fully
    /// cancelled before this one dispatches anything.
    pub async fn start_session(
        &self,
        transcript: impl Into<String>,
        voice: Option<Voice>,
    ) -> Result<SessionId, PipelineError> {
        let voice = voice.unwrap_or(self.inner.config.default_voice);
        let mut control = self.inner.control.lock().await;
        if control.is_busy() {
            self.inner.interrupt_locked(&mut control).await;
            self.inner.transition(&mut control, Trigger::CancelComplete, None)?;
        }
        Ok(self
            .inner
            .launch_locked(&mut control, transcript.into(), voice)
            .await?)
    }

    /// Cancel `session` if it is the active one.
    pub async fn cancel_session(&self, session: SessionId) -> Result<(), PipelineError> {
        let mut control = self.inner.control.lock().await;
        if !control.owns(session) {
            return Err(PipelineError::UnknownSession(session));
        }
        self.inner.interrupt_locked(&mut control).await;
        self.inner.transition(&mut control, Trigger::CancelComplete, None)?;
        Ok(())
    }

    /// Explicit stop gesture. Returns whether anything was running.
    pub async fn stop(&self) -> Result<bool, PipelineError> {
        let mut control = self.inner.control.lock().await;
        if !control.is_busy() {
            return Ok(false);
        }
        self.inner.interrupt_locked(&mut control).await;
        self.inner.transition(&mut control, Trigger::CancelComplete, None)?;
        Ok(true)
    }

    pub async fn clear_history(&self) {
        self.inner.memory.lock().await.clear();
        info!("conversation history cleared");
    }
}

impl Inner {
    fn emit(&self, event: UiEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn transition(
        &self,
        control: &mut Control,
        trigger: Trigger,
        session_id: Option<SessionId>,
    ) -> Result<PipelineState, InvalidTransition> {
        let state = control.machine.apply(trigger)?;
        debug!(?trigger, ?state, "state changed");
        self.emit(UiEvent::StateChanged { state, session_id });
        Ok(state)
    }

    async fn set_current(&self, session: Option<Arc<PipelineSession>>) {
        *self.current.lock().await = session;
    }

    /// Tear down whatever is in progress. Leaves the machine in `Cancelling`.
    ///
    /// Returns only once the session's network calls are aborted and the
    /// playback actor has confirmed its queue is cleared and the device is quiet.
    async fn interrupt_locked(&self, control: &mut Control) {
        control.capture_epoch += 1;
        let session_id = control.active.as_ref().map(|a| a.session.id);
        // Interrupt is legal from every state.
        let _ = self.transition(control, Trigger::Interrupt, session_id);

        let Some(active) = control.active.take() else {
            return;
        };
        active.session.cancel();
        self.playback.cancel(active.session.id).await;
        active.task.abort();
        if let Err(e) = active.task.await {
            if !e.is_cancelled() {
                warn!(session = %active.session.id, "session task failed: {e}");
            }
        }
        self.set_current(None).await;
        self.metrics.session_cancelled();
        info!(session = %active.session.id, "session cancelled");
    }

    async fn launch_locked(
        self: &Arc<Self>,
        control: &mut Control,
        transcript: String,
        voice: Voice,
    ) -> Result<SessionId, InvalidTransition> {
        if !control.machine.can(Trigger::TranscriptReady) {
            return Err(InvalidTransition {
                state: control.machine.state(),
                trigger: Trigger::TranscriptReady,
            });
        }
        let session = Arc::new(PipelineSession::new(transcript, voice));
        self.transition(control, Trigger::TranscriptReady, Some(session.id))?;

        self.set_current(Some(Arc::clone(&session))).await;
        self.metrics.session_started();
        info!(session = %session.id, %voice, "session started");

        let task = tokio::spawn(run_session(Arc::clone(self), Arc::clone(&session)));
        let id = session.id;
        control.active = Some(ActiveSession { session, task });
        Ok(id)
    }
}

async fn run_session(inner: Arc<Inner>, session: Arc<PipelineSession>) {
    let outcome = stream_and_speak(&inner, &session).await;
    finish_session(&inner, &session, outcome).await;
}

/// Stream the response, dispatch units as they become ready, then wait for
/// playback to drain.
async fn stream_and_speak(inner: &Inner, session: &PipelineSession) -> SessionOutcome {
    let messages = inner
        .memory
        .lock()
        .await
        .request_messages(&inner.system_prompt, &session.transcript);
    inner.playback.begin(session.id);

    let opened = tokio::select! {
        biased;
        _ = session.cancelled() => return SessionOutcome::Cancelled,
        opened = tokio::time::timeout(inner.config.chat_timeout, inner.chat.stream_chat(messages)) => opened,
    };
    let mut stream = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return SessionOutcome::Failed {
                cause: format!("chat request failed: {e}"),
            }
        }
        Err(_) => {
            return SessionOutcome::Failed {
                cause: "chat request timed out".into(),
            }
        }
    };

    let mut segmenter = SentenceSegmenter::new(inner.config.segmenter.clone());
    let mut dispatcher = UnitDispatcher::new(inner, session);
    let mut reply = String::new();

    let failure = loop {
        let next = tokio::select! {
            biased;
            _ = session.cancelled() => return SessionOutcome::Cancelled,
            next = tokio::time::timeout(inner.config.chat_timeout, stream.next()) => next,
        };
        match next {
            Ok(Some(Ok(ChatEvent::Delta(text)))) => {
                reply.push_str(&text);
                for unit in segmenter.push(&text) {
                    dispatcher.dispatch(unit);
                }
            }
            Ok(Some(Ok(ChatEvent::Finish))) | Ok(None) => break None,
            Ok(Some(Err(e))) => break Some(format!("response stream failed: {e}")),
            Err(_) => break Some("response stream timed out".to_string()),
        }
    };

    if let Some(cause) = failure {
        dispatcher.abort().await;
        return SessionOutcome::Failed { cause };
    }
    if let Some(rest) = segmenter.finish() {
        dispatcher.dispatch(rest);
    }
    if reply.trim().is_empty() {
        return SessionOutcome::Failed {
            cause: "the response was empty".into(),
        };
    }

    let drained = inner.playback.seal(session.id, dispatcher.last_unit);
    tokio::select! {
        biased;
        _ = session.cancelled() => SessionOutcome::Cancelled,
        result = drained => match result {
            Ok(()) => SessionOutcome::Completed { reply },
            Err(_) => SessionOutcome::Cancelled,
        },
    }
}

/// Turns segmented text into units and fans synthesis out to tasks.
struct UnitDispatcher<'a> {
    inner: &'a Inner,
    session: &'a PipelineSession,
    tasks: JoinSet<()>,
    last_unit: Option<UnitId>,
}

impl<'a> UnitDispatcher<'a> {
    fn new(inner: &'a Inner, session: &'a PipelineSession) -> Self {
        Self {
            inner,
            session,
            tasks: JoinSet::new(),
            last_unit: None,
        }
    }

    fn dispatch(&mut self, text: String) {
        if self.session.is_cancelled() {
            return;
        }
        let unit = SpeakableUnit {
            id: self.session.next_unit_id(),
            session_id: self.session.id,
            text,
        };
        self.last_unit = Some(unit.id);
        self.inner.emit(UiEvent::SentenceReady {
            session_id: unit.session_id,
            unit_id: unit.id,
            text: unit.text.clone(),
        });

        let spoken = self.inner.normalizer.normalize(&unit.text);
        if spoken.is_empty() {
            debug!(unit_id = unit.id, "nothing to say after normalizing");
            self.inner.playback.skip(unit.session_id, unit.id);
            return;
        }
        if self.session.is_cancelled() {
            return;
        }

        self.inner.metrics.unit_dispatched();
        let request = SynthesizeRequest {
            session_id: unit.session_id,
            unit_id: unit.id,
            text: spoken,
            voice: self.session.voice,
        };
        let synthesis = self.inner.synthesis.clone();
        let playback = self.inner.playback.clone();
        let metrics = Arc::clone(&self.inner.metrics);
        let token = self.session.token();
        self.tasks.spawn(async move {
            let result = synthesis.synthesize(request, &token).await;
            if token.is_cancelled() {
                debug!(unit_id = result.unit_id, "discarding result for cancelled session");
                return;
            }
            match &result.outcome {
                Ok(_) => metrics.unit_synthesized(result.elapsed, result.cache_hit),
                Err(e) => {
                    warn!(unit_id = result.unit_id, "synthesis failed, skipping unit: {e}");
                    metrics.unit_skipped();
                }
            }
            playback.submit(result);
        });
    }

    /// Abort outstanding synthesis and wait until none can still submit.
    async fn abort(&mut self) {
        self.tasks.shutdown().await;
    }
}

async fn finish_session(inner: &Arc<Inner>, session: &PipelineSession, outcome: SessionOutcome) {
    match outcome {
        // Whoever cancelled owns the state from here.
        SessionOutcome::Cancelled => {
            debug!(session = %session.id, "session task saw cancellation");
        }
        SessionOutcome::Completed { reply } => {
            let mut control = inner.control.lock().await;
            if !control.owns(session.id) {
                return;
            }
            let reply = remove_citations(&reply);
            inner
                .memory
                .lock()
                .await
                .record_exchange(&session.transcript, reply.trim());
            if let Err(e) = inner.transition(&mut control, Trigger::Drained, Some(session.id)) {
                warn!("{e}");
            }
            control.active = None;
            inner.set_current(None).await;
            inner.metrics.session_completed();
            inner.emit(UiEvent::SessionDone {
                session_id: session.id,
            });
            info!(session = %session.id, "session done");
        }
        SessionOutcome::Failed { cause } => {
            warn!(session = %session.id, "session failed: {cause}");
            // Further playback stops; audio already heard stays heard.
            inner.playback.cancel(session.id).await;

            {
                let mut control = inner.control.lock().await;
                if !control.owns(session.id) {
                    return;
                }
                if let Err(e) = inner.transition(&mut control, Trigger::Failed, Some(session.id)) {
                    warn!("{e}");
                }
            }

            let visible = !session.audio_started();
            if visible {
                inner.emit(UiEvent::SessionError {
                    session_id: session.id,
                    cause,
                });
                if inner.config.speak_fallback {
                    speak_fallback(inner, session).await;
                }
            }

            let mut control = inner.control.lock().await;
            if !control.owns(session.id) {
                return;
            }
            if let Err(e) = inner.transition(&mut control, Trigger::Settle, Some(session.id)) {
                warn!("{e}");
            }
            control.active = None;
            inner.set_current(None).await;
            inner.metrics.session_failed();
            if !visible {
                inner.emit(UiEvent::SessionDone {
                    session_id: session.id,
                });
            }
        }
    }
}

/// Speak the canned apology through the normal queue. Interruptible.
async fn speak_fallback(inner: &Inner, session: &PipelineSession) {
    inner.playback.begin(session.id);
    let token = session.token();
    let request = SynthesizeRequest {
        session_id: session.id,
        unit_id: FIRST_UNIT_ID,
        text: inner.normalizer.normalize(FALLBACK_REPLY),
        voice: session.voice,
    };
    let result = inner.synthesis.synthesize(request, &token).await;
    if token.is_cancelled() {
        return;
    }
    if let Err(e) = &result.outcome {
        warn!("could not synthesize fallback reply: {e}");
    }
    inner.playback.submit(result);
    let drained = inner.playback.seal(session.id, Some(FIRST_UNIT_ID));
    tokio::select! {
        biased;
        _ = session.cancelled() => {}
        _ = drained => {}
    }
}

/// Relay playback progress to metrics and UI subscribers.
async fn forward_playback_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<PlaybackEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            PlaybackEvent::Started {
                session_id,
                unit_id,
            } => {
                inner.metrics.unit_played();
                let current = inner.current.lock().await.clone();
                if let Some(session) = current.filter(|s| s.id == session_id) {
                    if session.mark_audio_started() {
                        inner.metrics.first_audio(session.started_at.elapsed());
                    }
                }
                inner.emit(UiEvent::PlaybackStarted {
                    session_id,
                    unit_id,
                });
            }
            PlaybackEvent::Finished { success: false, .. } => inner.metrics.playback_failed(),
            PlaybackEvent::Finished { .. } => {}
        }
    }
}
