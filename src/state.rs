//! Observable state of a listening session.
//!
//! Every change goes through [`StateHolder::set_state`], which applies it and
//! notifies subscribers in one step: watchers of the full [`PlayerState`]
//! and listeners of discrete [`Event`]s.

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::{
    events::Event,
    track::{PlaylistEntry, Track},
};

/// Capacity of the event channel. Slow listeners lose the oldest events.
const EVENT_CAPACITY: usize = 64;

/// Everything a front end needs to render a room.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlayerState {
    pub playing: bool,
    pub current: Option<PlaylistEntry>,
    pub metadata: Option<Track>,

    /// Epoch milliseconds at which the current track started.
    pub started_at_ms: u64,

    pub queue: Vec<PlaylistEntry>,
    pub shuffle: bool,
}

impl PlayerState {
    /// Seconds since the current track started, as of `now_ms`.
    #[must_use]
    pub fn elapsed_secs(&self, now_ms: u64) -> u64 {
        if self.current.is_none() || self.started_at_ms == 0 {
            return 0;
        }
        now_ms.saturating_sub(self.started_at_ms) / 1_000
    }
}

/// A single change to a [`PlayerState`].
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    Playing(bool),
    Current {
        entry: Option<PlaylistEntry>,
        metadata: Option<Track>,
    },
    StartedAt(u64),
    Queue(Vec<PlaylistEntry>),
    Shuffle(bool),
}

impl StateChange {
    /// Applies the change, returning the event to announce if anything
    /// actually changed.
    fn apply(self, state: &mut PlayerState) -> Option<Option<Event>> {
        match self {
            Self::Playing(playing) => (state.playing != playing).then(|| {
                state.playing = playing;
                Some(if playing { Event::Play } else { Event::Pause })
            }),
            Self::Current { entry, metadata } => {
                (state.current != entry || state.metadata != metadata).then(|| {
                    let changed_track = state.current != entry;
                    state.current = entry;
                    state.metadata = metadata;
                    changed_track.then_some(Event::TrackChanged)
                })
            }
            Self::StartedAt(started_at_ms) => (state.started_at_ms != started_at_ms).then(|| {
                state.started_at_ms = started_at_ms;
                None
            }),
            Self::Queue(queue) => (state.queue != queue).then(|| {
                state.queue = queue;
                Some(Event::QueueChanged)
            }),
            Self::Shuffle(shuffle) => (state.shuffle != shuffle).then(|| {
                state.shuffle = shuffle;
                Some(Event::ShuffleChanged)
            }),
        }
    }
}

/// Holds the state of one session and publishes its changes.
#[derive(Debug)]
pub struct StateHolder {
    state: watch::Sender<PlayerState>,
    events: broadcast::Sender<Event>,
}

impl Default for StateHolder {
    fn default() -> Self {
        Self::new(PlayerState::default())
    }
}

impl StateHolder {
    #[must_use]
    pub fn new(initial: PlayerState) -> Self {
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state, events }
    }

    /// Applies `change` and notifies subscribers if it changed anything.
    ///
    /// Returns whether it did.
    pub fn set_state(&self, change: StateChange) -> bool {
        let mut event = None;
        let modified = self.state.send_if_modified(|state| match change.apply(state) {
            Some(announce) => {
                event = announce;
                true
            }
            None => false,
        });

        if let Some(event) = event {
            // Nobody listening is fine.
            let _ = self.events.send(event);
        }
        modified
    }

    /// Announces an event that does not change the state.
    pub fn announce(&self, event: Event) {
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn snapshot(&self) -> PlayerState {
        self.state.borrow().clone()
    }

    /// Watches the full state. The receiver sees the latest state first.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    /// Listens to events emitted from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
