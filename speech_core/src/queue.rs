//! Reordering buffer between out-of-order synthesis and in-order playback.
//!
//! Pure bookkeeping: the playback actor owns one instance and drives the
//! device from the [`PlayItem`]s it hands back.
use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::types::{AudioClip, SessionId, SynthesisResult, UnitId, FIRST_UNIT_ID};

#[derive(Debug)]
enum Slot {
    Audio(AudioClip),
    Skipped,
}

/// A clip released for playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayItem {
    pub session_id: SessionId,
    pub unit_id: UnitId,
    pub clip: AudioClip,
}

#[derive(Debug)]
pub struct OrderedAudioQueue {
    session: Option<SessionId>,
    ready: BTreeMap<UnitId, Slot>,
    next_expected: UnitId,
    playing: Option<UnitId>,
    seen: HashSet<UnitId>,
    sealed_at: Option<Option<UnitId>>,
}

impl Default for OrderedAudioQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedAudioQueue {
    pub fn new() -> Self {
        Self {
            session: None,
            ready: BTreeMap::new(),
            next_expected: FIRST_UNIT_ID,
            playing: None,
            seen: HashSet::new(),
            sealed_at: None,
        }
    }

    /// Switch to a fresh session, dropping anything left from the previous one.
    ///
    /// Returns true when a clip was playing; the caller must stop the device.
    pub fn begin(&mut self, session: SessionId) -> bool {
        let was_playing = self.reset();
        self.session = Some(session);
        was_playing
    }

    /// Drop all state for `session`. Later results for it are discarded.
    ///
    /// Returns true when a clip was playing; the caller must stop the device.
    pub fn cancel(&mut self, session: SessionId) -> bool {
        if self.session != Some(session) {
            return false;
        }
        self.reset()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Store a synthesis outcome. Failures count as skips.
    pub fn submit(&mut self, result: SynthesisResult) -> Option<PlayItem> {
        let slot = match result.outcome {
            Ok(clip) => Slot::Audio(clip),
            Err(e) => {
                debug!(unit_id = result.unit_id, error = %e, "unit skipped after synthesis failure");
                Slot::Skipped
            }
        };
        self.insert(result.session_id, result.unit_id, slot)
    }

    /// Resolve a unit without audio so later units are not held back.
    pub fn skip(&mut self, session: SessionId, unit_id: UnitId) -> Option<PlayItem> {
        self.insert(session, unit_id, Slot::Skipped)
    }

    /// The active clip ended (or failed to play).
    pub fn on_playback_finished(&mut self) -> Option<PlayItem> {
        let unit_id = self.playing.take()?;
        self.next_expected = unit_id + 1;
        self.pump()
    }

    /// No more units will be dispatched; `last_unit` is the highest id handed out.
    pub fn seal(&mut self, session: SessionId, last_unit: Option<UnitId>) {
        if self.session == Some(session) {
            self.sealed_at = Some(last_unit);
        }
    }

    /// Sealed, idle, and past the final unit.
    pub fn is_drained(&self) -> bool {
        match self.sealed_at {
            Some(last) => {
                self.playing.is_none() && last.map_or(true, |last| self.next_expected > last)
            }
            None => false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    pub fn next_expected(&self) -> UnitId {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.ready.len()
    }

    fn insert(&mut self, session: SessionId, unit_id: UnitId, slot: Slot) -> Option<PlayItem> {
        if self.session != Some(session) {
            debug!(%session, unit_id, "discarding result for inactive session");
            return None;
        }
        if unit_id < self.next_expected || !self.seen.insert(unit_id) {
            warn!(%session, unit_id, "duplicate unit ignored");
            return None;
        }
        self.ready.insert(unit_id, slot);
        self.pump()
    }

    /// Release the next clip if the device is free and it is ready.
    /// Skipped slots at the head advance the cursor without playing.
    fn pump(&mut self) -> Option<PlayItem> {
        if self.playing.is_some() {
            return None;
        }
        let session_id = self.session?;
        while let Some(slot) = self.ready.remove(&self.next_expected) {
            match slot {
                Slot::Skipped => self.next_expected += 1,
                Slot::Audio(clip) => {
                    self.playing = Some(self.next_expected);
                    return Some(PlayItem {
                        session_id,
                        unit_id: self.next_expected,
                        clip,
                    });
                }
            }
        }
        None
    }

    fn reset(&mut self) -> bool {
        let was_playing = self.playing.is_some();
        self.session = None;
        self.ready.clear();
        self.seen.clear();
        self.playing = None;
        self.next_expected = FIRST_UNIT_ID;
        self.sealed_at = None;
        was_playing
    }
}
