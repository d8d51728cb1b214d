//! The sequence of tracks a room plays.
//!
//! Explicit requests wait in a FIFO queue and always go first. When the
//! queue is empty and shuffle is on, the [`Selector`] recommends something.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, PoisonError},
};

use crate::{
    shuffle::Selector,
    track::{ParticipantId, PlaylistEntry, TrackId},
};

#[derive(Debug)]
struct QueueState {
    explicit: VecDeque<PlaylistEntry>,
    shuffle_enabled: bool,
    current: Option<PlaylistEntry>,

    /// Whether `current` was chosen by the selector.
    currently_shuffling: bool,
}

/// Decides what a room plays next.
pub struct Sequencer {
    state: Mutex<QueueState>,
    selector: Selector,
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("state", &*self.lock())
            .field("selector", &self.selector)
            .finish()
    }
}

impl Sequencer {
    /// Shuffle starts enabled.
    #[must_use]
    pub fn new(selector: Selector) -> Self {
        Self {
            state: Mutex::new(QueueState {
                explicit: VecDeque::new(),
                shuffle_enabled: true,
                current: None,
                currently_shuffling: false,
            }),
            selector,
        }
    }

    /// Appends a request to the explicit queue.
    pub fn enqueue_explicit(&self, id: TrackId, requester: ParticipantId) {
        let entry = PlaylistEntry::requested(id, requester);
        debug!("queueing {entry}");
        self.lock().explicit.push_back(entry);
    }

    /// Pops the head of the explicit queue without playing it.
    pub fn dequeue_explicit(&self) -> Option<PlaylistEntry> {
        self.lock().explicit.pop_front()
    }

    /// Removes every queued entry for `id`, returning how many there were.
    ///
    /// Entries already handed out by [`advance`](Self::advance) are not
    /// affected.
    pub fn remove_from_queue(&self, id: &TrackId) -> usize {
        let mut state = self.lock();
        let before = state.explicit.len();
        state.explicit.retain(|entry| entry.id != *id);
        before - state.explicit.len()
    }

    /// Moves on to the next track.
    ///
    /// Pops the explicit queue, or asks the selector when the queue is
    /// empty and shuffle is enabled. The chosen track enters the play
    /// history and becomes the current entry; when nothing is chosen the
    /// current entry is cleared.
    pub async fn advance(&self) -> Option<PlaylistEntry> {
        let (explicit, shuffle_enabled) = {
            let mut state = self.lock();
            (state.explicit.pop_front(), state.shuffle_enabled)
        };

        let entry = match explicit {
            Some(entry) => Some(entry),
            None if shuffle_enabled => self
                .selector
                .get_next()
                .await
                .map(|candidate| PlaylistEntry::shuffled(candidate.id)),
            None => None,
        };

        if let Some(entry) = &entry {
            self.selector.record_played(&entry.id);
        }

        let mut state = self.lock();
        state.currently_shuffling = entry.as_ref().is_some_and(PlaylistEntry::is_shuffled);
        state.current.clone_from(&entry);
        entry
    }

    /// Forgets the current entry, for instance after it failed to play.
    pub fn clear_current(&self) {
        let mut state = self.lock();
        state.current = None;
        state.currently_shuffling = false;
    }

    /// The explicit queue, head first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PlaylistEntry> {
        self.lock().explicit.iter().cloned().collect()
    }

    pub fn set_shuffle_enabled(&self, enabled: bool) {
        self.lock().shuffle_enabled = enabled;
    }

    #[must_use]
    pub fn shuffle_enabled(&self) -> bool {
        self.lock().shuffle_enabled
    }

    #[must_use]
    pub fn current(&self) -> Option<PlaylistEntry> {
        self.lock().current.clone()
    }

    /// Whether the current entry came from the selector.
    ///
    /// A fresh explicit request should interrupt a shuffled track but not a
    /// requested one.
    #[must_use]
    pub fn currently_shuffling(&self) -> bool {
        self.lock().currently_shuffling
    }

    #[must_use]
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        cache::Caches,
        config::ShuffleConfig,
        local::{DirectoryMedia, MemoryPlayStore, StaticParticipants},
        media::MediaLibrary,
        track::{PlayRecord, Track},
        util::now_from_epoch,
    };

    fn sequencer(records: Vec<PlayRecord>) -> Sequencer {
        let selector = Selector::new(
            "room".into(),
            ShuffleConfig::default(),
            Arc::new(StaticParticipants::new(vec!["a".into()])),
            Arc::new(MemoryPlayStore::with_records(records)),
            MediaLibrary::new(Arc::new(DirectoryMedia::new("does-not-exist")), -14.0),
            &Caches::in_memory(),
            Duration::from_secs(600),
        );
        Sequencer::new(selector)
    }

    fn played(track: &str) -> PlayRecord {
        PlayRecord {
            track: Track::new(track, track, "someone").with_duration(200.0),
            participant: "a".into(),
            room: "room".into(),
            timestamp: now_from_epoch(),
            imported: false,
        }
    }

    #[tokio::test]
    async fn plays_requests_in_order_once() {
        let queue = sequencer(vec![played("shuffled")]);
        queue.set_shuffle_enabled(false);
        for id in ["a", "b", "c"] {
            queue.enqueue_explicit(id.into(), "someone".into());
        }

        let mut order = Vec::new();
        while let Some(entry) = queue.advance().await {
            assert!(!entry.is_shuffled());
            order.push(entry.id.to_string());
        }
        assert_eq!(order, ["a", "b", "c"]);
        assert!(queue.current().is_none());
    }

    #[tokio::test]
    async fn removes_every_occurrence() {
        let queue = sequencer(Vec::new());
        queue.set_shuffle_enabled(false);
        for id in ["a", "b", "a", "c"] {
            queue.enqueue_explicit(id.into(), "someone".into());
        }

        let head = queue.advance().await.unwrap();
        assert_eq!(head.id.as_str(), "a");

        assert_eq!(queue.remove_from_queue(&"a".into()), 1);
        assert_eq!(queue.remove_from_queue(&"x".into()), 0);
        let remaining: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|entry| entry.id.to_string())
            .collect();
        assert_eq!(remaining, ["b", "c"]);
        assert_eq!(queue.current().unwrap(), head);
    }

    #[tokio::test]
    async fn falls_back_to_shuffle() {
        let queue = sequencer(vec![played("shuffled")]);
        queue.enqueue_explicit("requested".into(), "someone".into());

        let first = queue.advance().await.unwrap();
        assert_eq!(first.id.as_str(), "requested");
        assert!(!queue.currently_shuffling());

        let second = queue.advance().await.unwrap();
        assert_eq!(second, PlaylistEntry::shuffled("shuffled".into()));
        assert!(queue.currently_shuffling());
        assert!(queue.selector().recently_played(&"shuffled".into()));

        // The only candidate is in the history window now.
        assert!(queue.advance().await.is_none());
        assert!(!queue.currently_shuffling());
    }

    #[tokio::test]
    async fn dequeues_without_playing() {
        let queue = sequencer(Vec::new());
        queue.enqueue_explicit("a".into(), "someone".into());
        assert_eq!(queue.dequeue_explicit().unwrap().id.as_str(), "a");
        assert!(queue.dequeue_explicit().is_none());
        assert!(queue.current().is_none());
        assert!(!queue.selector().recently_played(&"a".into()));
    }

    #[tokio::test]
    async fn clearing_forgets_the_current_entry() {
        let queue = sequencer(vec![played("shuffled")]);
        assert!(queue.advance().await.is_some());
        assert!(queue.currently_shuffling());

        queue.clear_current();
        assert!(queue.current().is_none());
        assert!(!queue.currently_shuffling());
    }
}
