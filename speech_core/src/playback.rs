//! The playback actor.
//!
//! One task owns the [`OrderedAudioQueue`] and the [`AudioPlayerController`].
//! Everything else talks to it through a [`PlaybackHandle`], so queue state
//! is only ever touched from this task.
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::player::{AudioPlayerController, PlaybackOutcome};
use crate::queue::{OrderedAudioQueue, PlayItem};
use crate::types::{SessionId, SynthesisResult, UnitId};

/// Progress reports from the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started {
        session_id: SessionId,
        unit_id: UnitId,
    },
    Finished {
        session_id: SessionId,
        unit_id: UnitId,
        success: bool,
    },
}

enum Command {
    Begin(SessionId),
    Submit(SynthesisResult),
    Skip(SessionId, UnitId),
    Seal {
        session: SessionId,
        last_unit: Option<UnitId>,
        drained: oneshot::Sender<()>,
    },
    Cancel {
        session: SessionId,
        ack: oneshot::Sender<()>,
    },
}

enum Step {
    Command(Option<Command>),
    Finished(PlaybackOutcome),
}

/// Cheap to clone; all clones feed the same actor.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PlaybackHandle {
    /// Spawn the actor. It runs until every handle is dropped.
    pub fn spawn(
        player: AudioPlayerController,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = PlaybackActor {
            rx,
            player,
            queue: OrderedAudioQueue::new(),
            events,
            drain_waiter: None,
        };
        (Self { tx }, tokio::spawn(actor.run()))
    }

    /// Make `session` the live one. Results for any other session are dropped.
    pub fn begin(&self, session: SessionId) {
        self.send(Command::Begin(session));
    }

    pub fn submit(&self, result: SynthesisResult) {
        self.send(Command::Submit(result));
    }

    pub fn skip(&self, session: SessionId, unit_id: UnitId) {
        self.send(Command::Skip(session, unit_id));
    }

    /// Declare the session's last unit. The receiver resolves once that unit
    /// has played or been skipped; it errors if the session is cancelled.
    pub fn seal(&self, session: SessionId, last_unit: Option<UnitId>) -> oneshot::Receiver<()> {
        let (drained, rx) = oneshot::channel();
        self.send(Command::Seal {
            session,
            last_unit,
            drained,
        });
        rx
    }

    /// Clear the session's queue and stop its audio. Returns once the device is quiet.
    pub async fn cancel(&self, session: SessionId) {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Cancel { session, ack });
        if rx.await.is_err() {
            warn!(%session, "playback actor gone before cancel was acknowledged");
        }
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("playback actor is not running");
        }
    }
}

struct PlaybackActor {
    rx: mpsc::UnboundedReceiver<Command>,
    player: AudioPlayerController,
    queue: OrderedAudioQueue,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    drain_waiter: Option<(SessionId, oneshot::Sender<()>)>,
}

impl PlaybackActor {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.rx.recv() => Step::Command(command),
                outcome = self.player.finished() => Step::Finished(outcome),
            };
            match step {
                Step::Command(Some(command)) => self.handle(command).await,
                Step::Command(None) => break,
                Step::Finished(outcome) => self.on_finished(outcome),
            }
        }
        self.player.stop().await;
        debug!("playback actor stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Begin(session) => {
                if self.queue.begin(session) {
                    self.player.stop().await;
                }
                self.drain_waiter = None;
            }
            Command::Submit(result) => {
                let next = self.queue.submit(result);
                self.play(next);
            }
            Command::Skip(session, unit_id) => {
                let next = self.queue.skip(session, unit_id);
                self.play(next);
            }
            Command::Seal {
                session,
                last_unit,
                drained,
            } => {
                if self.queue.session() == Some(session) {
                    self.queue.seal(session, last_unit);
                    self.drain_waiter = Some((session, drained));
                }
            }
            Command::Cancel { session, ack } => {
                if self.queue.cancel(session) {
                    self.player.stop().await;
                }
                if self.drain_waiter.as_ref().is_some_and(|(s, _)| *s == session) {
                    self.drain_waiter = None;
                }
                info!(%session, "playback cancelled");
                let _ = ack.send(());
            }
        }
        self.check_drained();
    }

    fn on_finished(&mut self, outcome: PlaybackOutcome) {
        if let Err(e) = &outcome.result {
            warn!(unit_id = outcome.unit_id, "playback failed, moving on: {e}");
        }
        self.emit(PlaybackEvent::Finished {
            session_id: outcome.session_id,
            unit_id: outcome.unit_id,
            success: outcome.result.is_ok(),
        });
        let next = self.queue.on_playback_finished();
        self.play(next);
        self.check_drained();
    }

    fn play(&mut self, item: Option<PlayItem>) {
        let Some(item) = item else {
            return;
        };
        self.emit(PlaybackEvent::Started {
            session_id: item.session_id,
            unit_id: item.unit_id,
        });
        self.player.start(item);
    }

    fn check_drained(&mut self) {
        if self.queue.is_drained() {
            if let Some((session, drained)) = self.drain_waiter.take() {
                debug!(%session, "playback drained");
                let _ = drained.send(());
            }
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }
}
