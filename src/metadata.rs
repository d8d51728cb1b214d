//! Display metadata of tracks.
//!
//! Titles, authors and durations come from the metadata collaborator, which
//! may be slow (it can involve catalog matching). Answers are kept in a
//! persistent cache so a restart does not look everything up again, and
//! concurrent requests for the same track share one lookup.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    cache::{Caches, TtlCache},
    error::{Error, Result},
    lookup::CachedLookup,
    provider::MetadataProvider,
    track::{Track, TrackId},
};

/// Name of the persistent cache holding display metadata.
pub const CACHE_NAME: &str = "song-display-metadata";

#[derive(Clone)]
pub struct MetadataService {
    provider: Arc<dyn MetadataProvider>,
    lookup: CachedLookup<Track>,
}

impl fmt::Debug for MetadataService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataService")
            .field("lookup", &self.lookup)
            .finish_non_exhaustive()
    }
}

impl MetadataService {
    #[must_use]
    pub fn new(provider: Arc<dyn MetadataProvider>, cache: TtlCache<Track>) -> Self {
        Self {
            provider,
            lookup: CachedLookup::new(cache),
        }
    }

    #[must_use]
    pub fn open(provider: Arc<dyn MetadataProvider>, caches: &Caches, ttl: Duration) -> Self {
        Self::new(provider, caches.open(CACHE_NAME, ttl))
    }

    /// Returns the display metadata of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] when the platform does not know the
    /// track, or the collaborator's error.
    ///
    /// [`ErrorKind::NotFound`]: crate::error::ErrorKind::NotFound
    pub async fn get(&self, id: &TrackId) -> Result<Track> {
        let provider = Arc::clone(&self.provider);
        let track = id.clone();
        self.lookup
            .get_or_fetch(id.as_str(), move || async move {
                provider
                    .fetch_display_metadata(&track)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("no metadata for track {track}")))
            })
            .await
    }

    /// Like [`get`](Self::get), but logs failures and returns `None`.
    pub async fn get_or_log(&self, id: &TrackId) -> Option<Track> {
        match self.get(id).await {
            Ok(track) => Some(track),
            Err(e) => {
                warn!("failed to get metadata for track {id}: {e}");
                None
            }
        }
    }

    /// Caches metadata that is already known, for instance from play records.
    pub fn remember(&self, track: Track) {
        let key = track.id.to_string();
        self.lookup.cache().set(key, track);
    }
}
