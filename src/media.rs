//! Playable audio for tracks.
//!
//! Resolving audio may mean downloading and transcoding, so resolved
//! handles are kept for the lifetime of the process and concurrent requests
//! for one track share a single resolution. [`MediaLibrary::prefetch`]
//! starts a resolution in the background so that a later
//! [`MediaLibrary::resolve`] finds it ready.

use std::{fmt, sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    cache::TtlCache,
    error::Result,
    lookup::CachedLookup,
    provider::{MediaHandle, MediaProvider},
    track::TrackId,
};

/// Gain in decibels that brings a track measured at `loudness` LUFS to
/// `target_lufs`. Unmeasured tracks are left alone.
#[must_use]
pub fn normalization_gain(target_lufs: f32, loudness: Option<f32>) -> f32 {
    loudness
        .filter(|lufs| lufs.is_finite())
        .map_or(0.0, |lufs| target_lufs - lufs)
}

#[derive(Clone)]
pub struct MediaLibrary {
    provider: Arc<dyn MediaProvider>,
    lookup: CachedLookup<MediaHandle>,
    target_lufs: f32,
}

impl fmt::Debug for MediaLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaLibrary")
            .field("target_lufs", &self.target_lufs)
            .finish_non_exhaustive()
    }
}

impl MediaLibrary {
    /// Handles are kept until the process exits.
    #[must_use]
    pub fn new(provider: Arc<dyn MediaProvider>, target_lufs: f32) -> Self {
        Self {
            provider,
            lookup: CachedLookup::new(TtlCache::in_memory("audio-resources", Duration::MAX)),
            target_lufs,
        }
    }

    /// Returns playable audio for `id`, normalized for `loudness` when
    /// known.
    ///
    /// # Errors
    ///
    /// Returns the media collaborator's error. Failures are not cached.
    pub async fn resolve(&self, id: &TrackId, loudness: Option<f32>) -> Result<MediaHandle> {
        let provider = Arc::clone(&self.provider);
        let track = id.clone();
        let mut handle = self
            .lookup
            .get_or_fetch(id.as_str(), move || async move {
                provider.resolve_playable_audio(&track).await
            })
            .await?;

        if loudness.is_some() {
            handle.gain_db = normalization_gain(self.target_lufs, loudness);
        }
        Ok(handle)
    }

    /// Starts resolving `id` in the background.
    pub fn prefetch(&self, id: TrackId, loudness: Option<f32>) -> JoinHandle<()> {
        let library = self.clone();
        tokio::spawn(async move {
            match library.resolve(&id, loudness).await {
                Ok(handle) => debug!("prepared audio for {handle}"),
                Err(e) => warn!("failed to prepare audio for track {id}: {e}"),
            }
        })
    }

    /// Whether audio for `id` has been resolved already.
    #[must_use]
    pub fn is_ready(&self, id: &TrackId) -> bool {
        self.lookup.cache().is_valid(id.as_str())
    }

    /// Forgets the handle of `id`, for instance after its file vanished.
    pub fn forget(&self, id: &TrackId) -> bool {
        self.lookup.invalidate(id.as_str())
    }
}
