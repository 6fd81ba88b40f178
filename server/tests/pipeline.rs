//! End-to-end pipeline behavior with scripted backends and a paused clock

mod common;

use std::time::Duration;

use bytes::Bytes;
use llm_core::{AudioFormat, ChatMessage, Recording};
use server::events::UiEvent;
use server::orchestrator::PipelineError;
use server::state::PipelineState;
use server::PipelineConfig;
use tokio::time::Instant;

use common::*;

fn is_done(event: &UiEvent) -> bool {
    matches!(event, UiEvent::SessionDone { .. })
}

fn started(unit: u64) -> impl Fn(&UiEvent) -> bool {
    move |e| matches!(e, UiEvent::PlaybackStarted { unit_id, .. } if *unit_id == unit)
}

fn three_sentences() -> Vec<Step> {
    vec![delta("Hello world. "), delta("How are you? "), delta("Fine.")]
}

#[tokio::test(start_paused = true)]
async fn plays_in_unit_order_when_synthesis_finishes_out_of_order() {
    let h = Harness::new();
    h.chat.push_script(three_sentences());
    h.synth.rule("Hello", Duration::from_secs(3), Duration::from_secs(1));
    h.synth.rule("How", Duration::from_secs(1), Duration::from_secs(1));

    let mut rx = h.orchestrator.subscribe();
    let id = h.orchestrator.start_session("Hi", None).await.unwrap();
    let events = events_until(&mut rx, is_done).await;

    assert_eq!(played_units(&events), vec![1, 2, 3]);
    let sentences: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            UiEvent::SentenceReady { unit_id, text, .. } => Some((*unit_id, text.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(
        sentences,
        vec![(1, "Hello world."), (2, "How are you?"), (3, "Fine.")]
    );
    assert!(events.iter().all(|e| e.session_id().map_or(true, |s| s == id)));
    assert_eq!(
        events.last(),
        Some(&UiEvent::SessionDone { session_id: id })
    );

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.state, PipelineState::Done);
    assert_eq!(snapshot.session_id, None);

    let metrics = h.orchestrator.metrics().snapshot();
    assert_eq!(metrics.sessions.completed, 1);
    assert_eq!(metrics.units.played, 3);
    assert_eq!(metrics.first_audio.count, 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_unit_is_skipped_without_stalling_later_units() {
    let h = Harness::new();
    h.chat.push_script(three_sentences());
    h.synth.rule("Hello", Duration::ZERO, Duration::from_secs(35));
    h.synth.rule("How", Duration::from_secs(60), Duration::from_secs(1));

    let mut rx = h.orchestrator.subscribe();
    let begun = Instant::now();
    h.orchestrator.start_session("Hi", None).await.unwrap();

    let events = events_until(&mut rx, started(3)).await;
    let waited = begun.elapsed();
    assert!(waited >= Duration::from_secs(35), "unit 3 started after {waited:?}");
    assert!(waited < Duration::from_secs(36), "unit 3 started after {waited:?}");
    assert_eq!(played_units(&events), vec![1, 3]);

    events_until(&mut rx, is_done).await;
    let metrics = h.orchestrator.metrics().snapshot();
    assert_eq!(metrics.units.skipped, 1);
    assert_eq!(metrics.units.played, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_synthesis_skips_only_that_unit() {
    let h = Harness::new();
    h.chat.push_script(three_sentences());
    h.synth.failing("How");

    let mut rx = h.orchestrator.subscribe();
    h.orchestrator.start_session("Hi", None).await.unwrap();
    let events = events_until(&mut rx, is_done).await;

    assert_eq!(played_units(&events), vec![1, 3]);
    assert!(!events
        .iter()
        .any(|e| matches!(e, UiEvent::SessionError { .. })));
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_playback_and_later_units() {
    let h = Harness::new();
    h.chat.push_script(three_sentences());
    h.synth.rule("Hello", Duration::ZERO, Duration::from_secs(35));

    let mut rx = h.orchestrator.subscribe();
    let id = h.orchestrator.start_session("Hi", None).await.unwrap();
    events_until(&mut rx, started(1)).await;

    h.orchestrator.cancel_session(id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let after = buffered_events(&mut rx);
    assert!(played_units(&after).is_empty());
    assert!(!after.iter().any(is_done));
    let states: Vec<_> = after
        .iter()
        .filter_map(|e| match e {
            UiEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![PipelineState::Cancelling, PipelineState::Idle]);

    assert_eq!(h.orchestrator.snapshot().await.state, PipelineState::Idle);
    assert_eq!(h.orchestrator.metrics().snapshot().sessions.cancelled, 1);
    assert!(matches!(
        h.orchestrator.cancel_session(id).await,
        Err(PipelineError::UnknownSession(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn new_session_replaces_the_playing_one() {
    let h = Harness::new();
    h.chat.push_script(three_sentences());
    h.chat.push_reply("Sure thing.");
    h.synth.rule("Hello", Duration::ZERO, Duration::from_secs(35));

    let mut rx = h.orchestrator.subscribe();
    let first = h.orchestrator.start_session("Hi", None).await.unwrap();
    events_until(&mut rx, started(1)).await;

    let second = h.orchestrator.start_session("Never mind", None).await.unwrap();
    assert_ne!(first, second);
    let events = events_until(&mut rx, is_done).await;

    assert!(events
        .iter()
        .filter(|e| matches!(e, UiEvent::PlaybackStarted { .. }))
        .all(|e| e.session_id() == Some(second)));
    assert_eq!(played_units(&events), vec![1]);
    assert_eq!(
        events.last(),
        Some(&UiEvent::SessionDone { session_id: second })
    );
    assert!(events.contains(&UiEvent::StateChanged {
        state: PipelineState::Cancelling,
        session_id: Some(first),
    }));
}

#[tokio::test(start_paused = true)]
async fn empty_response_reports_error_and_speaks_fallback() {
    let h = Harness::new();
    h.chat.push_script(Vec::new());

    let mut rx = h.orchestrator.subscribe();
    let id = h.orchestrator.start_session("Hi", None).await.unwrap();
    let events = events_until(&mut rx, |e| {
        matches!(e, UiEvent::StateChanged { state: PipelineState::Done, .. })
    })
    .await;

    let error = events
        .iter()
        .find_map(|e| match e {
            UiEvent::SessionError { session_id, cause } => Some((*session_id, cause.clone())),
            _ => None,
        })
        .expect("session error");
    assert_eq!(error.0, id);
    assert!(error.1.contains("empty"));
    assert_eq!(played_units(&events), vec![1]);
    assert!(!events.iter().any(is_done));
    assert!(h.synth.calls().iter().any(|text| text.starts_with("Sorry")));

    // The machine reports the failure before the apology is heard.
    let errored = events
        .iter()
        .position(|e| matches!(e, UiEvent::StateChanged { state: PipelineState::Error, .. }))
        .expect("error state");
    let apology = events.iter().position(started(1)).expect("apology played");
    assert!(errored < apology);
    assert_eq!(h.orchestrator.metrics().snapshot().sessions.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn fallback_can_be_disabled() {
    let h = Harness::with_config(PipelineConfig {
        speak_fallback: false,
        ..PipelineConfig::default()
    });
    h.chat.push_script(Vec::new());

    let mut rx = h.orchestrator.subscribe();
    h.orchestrator.start_session("Hi", None).await.unwrap();
    let events = events_until(&mut rx, |e| {
        matches!(e, UiEvent::StateChanged { state: PipelineState::Done, .. })
    })
    .await;

    assert!(events
        .iter()
        .any(|e| matches!(e, UiEvent::SessionError { .. })));
    assert!(played_units(&events).is_empty());
    assert!(h.synth.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stream_failure_before_audio_drops_pending_units() {
    let h = Harness::new();
    h.chat.push_script(vec![
        delta("Hello world. "),
        fail_after(Duration::from_secs(1), "connection reset"),
    ]);
    h.synth.rule("Hello", Duration::from_secs(10), Duration::from_secs(1));

    let mut rx = h.orchestrator.subscribe();
    h.orchestrator.start_session("Hi", None).await.unwrap();
    let events = events_until(&mut rx, |e| {
        matches!(e, UiEvent::StateChanged { state: PipelineState::Done, .. })
    })
    .await;

    assert!(events
        .iter()
        .any(|e| matches!(e, UiEvent::SessionError { cause, .. } if cause.contains("connection reset"))));
    // Only the fallback plays.
    assert_eq!(played_units(&events), vec![1]);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(played_units(&buffered_events(&mut rx)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stream_failure_after_audio_ends_quietly() {
    let h = Harness::new();
    h.chat.push_script(vec![
        delta("Hello world. "),
        fail_after(Duration::from_secs(5), "connection reset"),
    ]);

    let mut rx = h.orchestrator.subscribe();
    let id = h.orchestrator.start_session("Hi", None).await.unwrap();
    let events = events_until(&mut rx, is_done).await;

    assert_eq!(played_units(&events), vec![1]);
    assert!(!events
        .iter()
        .any(|e| matches!(e, UiEvent::SessionError { .. })));
    assert!(events.contains(&UiEvent::StateChanged {
        state: PipelineState::Error,
        session_id: Some(id),
    }));
    assert_eq!(h.orchestrator.snapshot().await.state, PipelineState::Done);
}

#[tokio::test(start_paused = true)]
async fn completed_exchange_feeds_the_next_request() {
    let h = Harness::new();
    h.chat.push_reply("It is sunny[1].");
    h.chat.push_reply("You're welcome.");

    let mut rx = h.orchestrator.subscribe();
    h.orchestrator.start_session("Weather?", None).await.unwrap();
    events_until(&mut rx, is_done).await;
    h.orchestrator.start_session("Thanks", None).await.unwrap();
    events_until(&mut rx, is_done).await;

    let requests = h.chat.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].len(), 2);
    let second = &requests[1];
    assert_eq!(second.len(), 4);
    assert_eq!(second[1], ChatMessage::user("Weather?"));
    assert_eq!(second[2], ChatMessage::assistant("It is sunny."));
    assert_eq!(second[3], ChatMessage::user("Thanks"));
    assert_eq!(h.orchestrator.snapshot().await.history_messages, 4);

    h.orchestrator.clear_history().await;
    assert_eq!(h.orchestrator.snapshot().await.history_messages, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_session_is_not_remembered() {
    let h = Harness::new();
    h.chat.push_script(three_sentences());
    h.synth.rule("Hello", Duration::ZERO, Duration::from_secs(35));

    let mut rx = h.orchestrator.subscribe();
    let id = h.orchestrator.start_session("Hi", None).await.unwrap();
    events_until(&mut rx, started(1)).await;
    h.orchestrator.cancel_session(id).await.unwrap();

    assert_eq!(h.orchestrator.snapshot().await.history_messages, 0);
}

#[tokio::test(start_paused = true)]
async fn exchange_is_remembered_only_when_the_session_completes() {
    let h = Harness::new();
    h.chat.push_reply("All done here.");

    let mut rx = h.orchestrator.subscribe();
    let id = h.orchestrator.start_session("Hi", None).await.unwrap();
    events_until(&mut rx, started(1)).await;
    // Race the cancel against the end of the only clip.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let cancelled = h.orchestrator.cancel_session(id).await.is_ok();

    let snapshot = h.orchestrator.snapshot().await;
    if cancelled {
        assert_eq!(snapshot.history_messages, 0);
        assert_eq!(snapshot.state, PipelineState::Idle);
    } else {
        assert_eq!(snapshot.history_messages, 2);
        assert_eq!(snapshot.state, PipelineState::Done);
    }
}

#[tokio::test(start_paused = true)]
async fn recording_is_transcribed_into_a_session() {
    let h = Harness::new();
    h.chat.push_reply("It is noon.");

    let mut rx = h.orchestrator.subscribe();
    h.orchestrator.capture_started().await.unwrap();
    assert_eq!(h.orchestrator.snapshot().await.state, PipelineState::Listening);

    let started = h
        .orchestrator
        .capture_stopped(Recording {
            bytes: Bytes::from_static(b"fake audio"),
            format: AudioFormat::M4a,
        })
        .await
        .unwrap();
    assert_eq!(started.transcript, "What time is it?");

    let events = events_until(&mut rx, is_done).await;
    assert!(events.contains(&UiEvent::PartialTranscript {
        text: "What time is it?".into()
    }));
    assert_eq!(
        h.chat.requests()[0].last(),
        Some(&ChatMessage::user("What time is it?"))
    );
}

#[tokio::test(start_paused = true)]
async fn silent_recording_returns_to_idle() {
    let h = Harness::new();
    *h.transcriber.text.lock().unwrap() = Ok("   ".into());

    h.orchestrator.capture_started().await.unwrap();
    let result = h
        .orchestrator
        .capture_stopped(Recording {
            bytes: Bytes::from_static(b"fake audio"),
            format: AudioFormat::Wav,
        })
        .await;

    assert!(matches!(result, Err(PipelineError::EmptyTranscript)));
    assert_eq!(h.orchestrator.snapshot().await.state, PipelineState::Idle);
    assert!(h.chat.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn capture_start_interrupts_speech() {
    let h = Harness::new();
    h.chat.push_script(three_sentences());
    h.synth.rule("Hello", Duration::ZERO, Duration::from_secs(35));

    let mut rx = h.orchestrator.subscribe();
    h.orchestrator.start_session("Hi", None).await.unwrap();
    events_until(&mut rx, started(1)).await;

    h.orchestrator.capture_started().await.unwrap();
    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.state, PipelineState::Listening);
    assert_eq!(snapshot.session_id, None);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(played_units(&buffered_events(&mut rx)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_reports_whether_anything_ran() {
    let h = Harness::new();
    h.chat.push_script(three_sentences());

    assert!(!h.orchestrator.stop().await.unwrap());
    h.orchestrator.start_session("Hi", None).await.unwrap();
    assert!(h.orchestrator.stop().await.unwrap());
    assert_eq!(h.orchestrator.snapshot().await.state, PipelineState::Idle);
}
