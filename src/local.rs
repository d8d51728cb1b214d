//! Collaborators that live on the local machine.
//!
//! These let jukebox run without a chat platform or a media service: plays
//! are kept in a JSON file, everyone listed in the configuration is always
//! present, audio files sit in a directory named by track id, and the audio
//! output only pretends to play. The in-memory variants double as test
//! fixtures.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, Instant},
};

use crate::{
    error::{Error, Result},
    provider::{
        AudioOutput, MediaHandle, MediaProvider, MetadataProvider, OutputProvider, OutputStatus,
        ParticipantProvider, PlayStore,
    },
    track::{ParticipantId, PlayRecord, RoomId, Track, TrackId},
};

/// A skip of a track, as logged by [`PlayStore::persist_skip`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub track: TrackId,
    pub participant: ParticipantId,
    pub room: RoomId,
    pub timestamp: u64,
}

/// Everything a play store holds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayLog {
    #[serde(default)]
    pub plays: Vec<PlayRecord>,
    #[serde(default)]
    pub skips: Vec<SkipRecord>,
}

/// Plays and skips kept in memory.
///
/// Also answers metadata lookups from the tracks of its records.
#[derive(Debug, Default)]
pub struct MemoryPlayStore {
    log: Mutex<PlayLog>,
}

impl MemoryPlayStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_records(plays: Vec<PlayRecord>) -> Self {
        Self::from_log(PlayLog {
            plays,
            skips: Vec::new(),
        })
    }

    #[must_use]
    pub fn from_log(log: PlayLog) -> Self {
        Self {
            log: Mutex::new(log),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PlayLog {
        self.lock().clone()
    }

    #[must_use]
    pub fn records(&self) -> Vec<PlayRecord> {
        self.lock().plays.clone()
    }

    #[must_use]
    pub fn skips(&self) -> Vec<SkipRecord> {
        self.lock().skips.clone()
    }

    /// The most recently recorded version of a track.
    #[must_use]
    pub fn find_track(&self, id: &TrackId) -> Option<Track> {
        self.lock()
            .plays
            .iter()
            .rev()
            .find(|record| record.track.id == *id)
            .map(|record| record.track.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlayLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PlayStore for MemoryPlayStore {
    async fn persist_play_record(&self, record: PlayRecord) -> Result<()> {
        self.lock().plays.push(record);
        Ok(())
    }

    async fn persist_skip(
        &self,
        track: &TrackId,
        participant: &ParticipantId,
        room: &RoomId,
        timestamp: u64,
    ) -> Result<()> {
        self.lock().skips.push(SkipRecord {
            track: track.clone(),
            participant: participant.clone(),
            room: room.clone(),
            timestamp,
        });
        Ok(())
    }

    async fn load_play_records(&self, room: &RoomId) -> Result<Vec<PlayRecord>> {
        Ok(self
            .lock()
            .plays
            .iter()
            .filter(|record| record.room == *room)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MetadataProvider for MemoryPlayStore {
    async fn fetch_display_metadata(&self, track: &TrackId) -> Result<Option<Track>> {
        Ok(self.find_track(track))
    }
}

/// Plays and skips in a JSON file, rewritten after every change.
#[derive(Debug)]
pub struct JsonPlayStore {
    path: PathBuf,
    memory: MemoryPlayStore,

    /// Serializes rewrites of the file.
    writing: tokio::sync::Mutex<()>,
}

impl JsonPlayStore {
    /// Prevent out-of-memory conditions on a corrupt file.
    const MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;

    /// Loads the log at `path`. A missing file is an empty log.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let log = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.len() > Self::MAX_FILE_SIZE => {
                return Err(Error::invalid_argument(format!(
                    "{} is too large ({} bytes)",
                    path.display(),
                    metadata.len()
                )));
            }
            Ok(_) => serde_json::from_slice(&tokio::fs::read(&path).await?)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{} does not exist yet, starting empty", path.display());
                PlayLog::default()
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            "loaded {} plays and {} skips from {}",
            log.plays.len(),
            log.skips.len(),
            path.display()
        );
        Ok(Self {
            path,
            memory: MemoryPlayStore::from_log(log),
            writing: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryPlayStore {
        &self.memory
    }

    async fn save(&self) -> Result<()> {
        let _writing = self.writing.lock().await;
        let contents = serde_json::to_vec_pretty(&self.memory.snapshot())?;

        let partial = self.path.with_extension("json.partial");
        tokio::fs::write(&partial, contents).await?;
        tokio::fs::rename(&partial, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PlayStore for JsonPlayStore {
    async fn persist_play_record(&self, record: PlayRecord) -> Result<()> {
        self.memory.persist_play_record(record).await?;
        self.save().await
    }

    async fn persist_skip(
        &self,
        track: &TrackId,
        participant: &ParticipantId,
        room: &RoomId,
        timestamp: u64,
    ) -> Result<()> {
        self.memory
            .persist_skip(track, participant, room, timestamp)
            .await?;
        self.save().await
    }

    async fn load_play_records(&self, room: &RoomId) -> Result<Vec<PlayRecord>> {
        self.memory.load_play_records(room).await
    }
}

#[async_trait]
impl MetadataProvider for JsonPlayStore {
    async fn fetch_display_metadata(&self, track: &TrackId) -> Result<Option<Track>> {
        self.memory.fetch_display_metadata(track).await
    }
}

/// The same participants in every room.
#[derive(Debug, Default)]
pub struct StaticParticipants {
    participants: Mutex<Vec<ParticipantId>>,
}

impl StaticParticipants {
    #[must_use]
    pub fn new(participants: Vec<ParticipantId>) -> Self {
        Self {
            participants: Mutex::new(participants),
        }
    }

    /// Replaces the roster.
    pub fn set(&self, participants: Vec<ParticipantId>) {
        *self
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = participants;
    }
}

#[async_trait]
impl ParticipantProvider for StaticParticipants {
    async fn fetch_room_participants(&self, _room: &RoomId) -> Result<Vec<ParticipantId>> {
        Ok(self
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Audio files named `<track id>.<extension>` in one directory.
#[derive(Clone, Debug)]
pub struct DirectoryMedia {
    directory: PathBuf,
}

impl DirectoryMedia {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl MediaProvider for DirectoryMedia {
    async fn resolve_playable_audio(&self, track: &TrackId) -> Result<MediaHandle> {
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_stem().is_some_and(|stem| stem == track.as_str()) {
                return Ok(MediaHandle {
                    track: track.clone(),
                    location: path.display().to_string(),
                    gain_db: 0.0,
                });
            }
        }

        Err(Error::not_found(format!(
            "no audio for track {track} in {}",
            self.directory.display()
        )))
    }
}

/// Audio outputs that report a track as finished once its length has
/// passed, without producing any sound.
pub struct SimulatedOutputs {
    lengths: Arc<dyn MetadataProvider>,
    fallback: Duration,
    speedup: u32,
}

impl SimulatedOutputs {
    /// Tracks last as long as their metadata says, or `fallback` when it
    /// does not say, divided by `speedup`.
    #[must_use]
    pub fn new(lengths: Arc<dyn MetadataProvider>, fallback: Duration, speedup: u32) -> Self {
        Self {
            lengths,
            fallback,
            speedup: speedup.max(1),
        }
    }
}

impl OutputProvider for SimulatedOutputs {
    fn open(
        &self,
        room: &RoomId,
    ) -> Result<(Arc<dyn AudioOutput>, mpsc::UnboundedReceiver<OutputStatus>)> {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);
        let output = SimulatedOutput {
            room: room.clone(),
            lengths: Arc::clone(&self.lengths),
            fallback: self.fallback,
            speedup: self.speedup,
            status_tx,
            paused,
            track: Mutex::default(),
        };
        Ok((Arc::new(output), status_rx))
    }
}

struct SimulatedOutput {
    room: RoomId,
    lengths: Arc<dyn MetadataProvider>,
    fallback: Duration,
    speedup: u32,
    status_tx: mpsc::UnboundedSender<OutputStatus>,
    paused: watch::Sender<bool>,
    track: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedOutput {
    fn report(&self, status: OutputStatus) {
        // Nobody listening means the session is gone.
        let _ = self.status_tx.send(status);
    }

    fn is_active(&self) -> bool {
        self.lock().as_ref().is_some_and(|track| !track.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.track.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioOutput for SimulatedOutput {
    fn play(&self, media: &MediaHandle) -> Result<()> {
        let mut track = self.lock();
        if let Some(previous) = track.take() {
            previous.abort();
        }

        self.paused.send_replace(false);
        self.report(OutputStatus::Playing);
        info!(
            "room {} now playing {} at {:.2}x volume",
            self.room,
            media.track,
            media.volume_ratio()
        );

        let lengths = Arc::clone(&self.lengths);
        let fallback = self.fallback;
        let speedup = self.speedup;
        let id = media.track.clone();
        let status_tx = self.status_tx.clone();
        let paused = self.paused.subscribe();
        *track = Some(tokio::spawn(async move {
            let length = lengths
                .fetch_display_metadata(&id)
                .await
                .ok()
                .flatten()
                .and_then(|track| track.duration())
                .unwrap_or(fallback)
                / speedup;

            if play_for(length, paused).await {
                let _ = status_tx.send(OutputStatus::Idle);
            }
        }));
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        if self.is_active() && !self.paused.send_replace(true) {
            self.report(OutputStatus::Paused);
        }
        Ok(())
    }

    fn unpause(&self) -> Result<()> {
        if self.is_active() && self.paused.send_replace(false) {
            self.report(OutputStatus::Playing);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let Some(track) = self.lock().take() {
            let finished = track.is_finished();
            track.abort();
            if !finished {
                self.report(OutputStatus::Idle);
            }
        }
        Ok(())
    }
}

/// Waits until `length` of unpaused time has passed. Returns `false` if the
/// output went away first.
async fn play_for(mut remaining: Duration, mut paused: watch::Receiver<bool>) -> bool {
    loop {
        if *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                return false;
            }
            continue;
        }

        let resumed = Instant::now();
        tokio::select! {
            () = sleep(remaining) => return true,
            changed = paused.changed() => {
                if changed.is_err() {
                    return false;
                }
                remaining = remaining.saturating_sub(resumed.elapsed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(track: &str, room: &str) -> PlayRecord {
        PlayRecord {
            track: Track::new(track, format!("{track} title"), "someone").with_duration(120.0),
            participant: "a".into(),
            room: room.into(),
            timestamp: 1,
            imported: false,
        }
    }

    #[tokio::test]
    async fn json_store_survives_reopening() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("plays.json");

        let store = JsonPlayStore::open(&path).await.unwrap();
        store.persist_play_record(record("x", "room")).await.unwrap();
        store.persist_play_record(record("y", "elsewhere")).await.unwrap();
        store
            .persist_skip(&"x".into(), &"b".into(), &"room".into(), 2)
            .await
            .unwrap();

        let reopened = JsonPlayStore::open(&path).await.unwrap();
        let plays = reopened.load_play_records(&"room".into()).await.unwrap();
        assert_eq!(plays, [record("x", "room")]);
        assert_eq!(reopened.memory().skips().len(), 1);

        let track = reopened
            .fetch_display_metadata(&"y".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(track.title, "y title");
    }

    #[tokio::test]
    async fn corrupt_json_store_is_an_error() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("plays.json");
        std::fs::write(&path, "{").unwrap();

        let err = JsonPlayStore::open(&path).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DataLoss);
    }

    #[tokio::test]
    async fn finds_audio_by_track_id() {
        let directory = tempfile::tempdir().unwrap();
        std::fs::write(directory.path().join("dQw4w9WgXcQ.ogg"), b"").unwrap();
        let media = DirectoryMedia::new(directory.path());

        let handle = media.resolve_playable_audio(&"dQw4w9WgXcQ".into()).await.unwrap();
        assert!(handle.location.ends_with("dQw4w9WgXcQ.ogg"));

        let err = media.resolve_playable_audio(&"missing".into()).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    fn media(id: &str) -> MediaHandle {
        MediaHandle {
            track: id.into(),
            location: format!("{id}.ogg"),
            gain_db: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_tracks_end_after_their_length() {
        let lengths = Arc::new(MemoryPlayStore::with_records(vec![record("x", "room")]));
        let outputs = SimulatedOutputs::new(lengths, Duration::from_secs(10), 1);
        let (output, mut status) = outputs.open(&"room".into()).unwrap();

        output.play(&media("x")).unwrap();
        assert_eq!(status.recv().await, Some(OutputStatus::Playing));

        sleep(Duration::from_secs(60)).await;
        output.pause().unwrap();
        assert_eq!(status.recv().await, Some(OutputStatus::Paused));

        // Paused time does not count.
        sleep(Duration::from_secs(600)).await;
        assert!(status.try_recv().is_err());

        output.unpause().unwrap();
        assert_eq!(status.recv().await, Some(OutputStatus::Playing));
        sleep(Duration::from_secs(59)).await;
        assert!(status.try_recv().is_err());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(status.try_recv(), Ok(OutputStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_lengths_use_the_fallback() {
        let outputs = SimulatedOutputs::new(
            Arc::new(MemoryPlayStore::new()),
            Duration::from_secs(10),
            2,
        );
        let (output, mut status) = outputs.open(&"room".into()).unwrap();

        output.play(&media("unknown")).unwrap();
        assert_eq!(status.recv().await, Some(OutputStatus::Playing));
        sleep(Duration::from_secs(6)).await;
        assert_eq!(status.try_recv(), Ok(OutputStatus::Idle));

        // Nothing is playing, so there is nothing to stop.
        output.stop().unwrap();
        assert!(status.try_recv().is_err());
    }
}
