//! Rolling window of recently played tracks.

use std::time::Duration;

use crate::{
    cache::{Caches, TtlCache},
    track::{RoomId, TrackId},
};

/// Tracks played in a room within the last window, persisted across
/// restarts so a reboot does not replay the same songs.
#[derive(Clone, Debug)]
pub struct PlayHistory {
    cache: TtlCache<TrackId>,
}

impl PlayHistory {
    #[must_use]
    pub fn new(cache: TtlCache<TrackId>) -> Self {
        Self { cache }
    }

    #[must_use]
    pub fn open(room: &RoomId, caches: &Caches, window: Duration) -> Self {
        Self::new(caches.open(&format!("{room}-play-history"), window))
    }

    /// Marks `id` as played now, restarting its window.
    pub fn add(&self, id: &TrackId) {
        self.cache.set(id.as_str(), id.clone());
    }

    /// Whether `id` was played within the window.
    #[must_use]
    pub fn contains(&self, id: &TrackId) -> bool {
        self.cache.is_valid(id.as_str())
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.cache.ttl()
    }
}
