//! Interfaces to the systems jukebox depends on but does not implement.
//!
//! The chat platform, the media platform, the database and the audio
//! transport all live behind these traits. Implementations may be slow and
//! may fail; the core tolerates both.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    error::Result,
    track::{ParticipantId, PlayRecord, RoomId, Track, TrackId},
    util::db_to_ratio,
};

/// Something the audio output can play: a local file, a stream URL, or
/// whatever else the transport understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaHandle {
    pub track: TrackId,
    pub location: String,

    /// Gain in decibels to apply for loudness normalization.
    pub gain_db: f32,
}

impl MediaHandle {
    /// The normalization gain as a linear amplitude factor.
    #[must_use]
    pub fn volume_ratio(&self) -> f32 {
        db_to_ratio(self.gain_db)
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {} ({:+.1} dB)", self.track, self.location, self.gain_db)
    }
}

/// Retrieves playable audio for a track.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Returns where the audio of `track` can be played from.
    ///
    /// This may download and transcode, and may take many seconds.
    async fn resolve_playable_audio(&self, track: &TrackId) -> Result<MediaHandle>;
}

/// Looks up what a track is called and how long it is.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Returns `Ok(None)` when the platform does not know the track.
    async fn fetch_display_metadata(&self, track: &TrackId) -> Result<Option<Track>>;
}

/// Knows who is currently in a room.
#[async_trait]
pub trait ParticipantProvider: Send + Sync {
    async fn fetch_room_participants(&self, room: &RoomId) -> Result<Vec<ParticipantId>>;
}

/// Durable log of plays and skips.
#[async_trait]
pub trait PlayStore: Send + Sync {
    async fn persist_play_record(&self, record: PlayRecord) -> Result<()>;

    async fn persist_skip(
        &self,
        track: &TrackId,
        participant: &ParticipantId,
        room: &RoomId,
        timestamp: u64,
    ) -> Result<()>;

    /// All plays in `room`, each with its track.
    async fn load_play_records(&self, room: &RoomId) -> Result<Vec<PlayRecord>>;
}

/// Status reported by an audio output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OutputStatus {
    /// Audio started or resumed.
    Playing,
    /// Paused on request.
    Paused,
    /// Lost its output target but will resume when it returns.
    AutoPaused,
    /// Nothing is playing, typically because a track ended.
    Idle,
}

/// The audio transport of one room.
///
/// Commands are fire-and-forget; the outcome is reported asynchronously as
/// [`OutputStatus`] on the channel returned by [`OutputProvider::open`].
pub trait AudioOutput: Send + Sync {
    fn play(&self, media: &MediaHandle) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn unpause(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Opens the audio transport of a room.
pub trait OutputProvider: Send + Sync {
    fn open(
        &self,
        room: &RoomId,
    ) -> Result<(Arc<dyn AudioOutput>, mpsc::UnboundedReceiver<OutputStatus>)>;
}

/// Every collaborator a session needs, shared by all sessions.
#[derive(Clone)]
pub struct Services {
    pub media: Arc<dyn MediaProvider>,
    pub metadata: Arc<dyn MetadataProvider>,
    pub participants: Arc<dyn ParticipantProvider>,
    pub plays: Arc<dyn PlayStore>,
    pub outputs: Arc<dyn OutputProvider>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
