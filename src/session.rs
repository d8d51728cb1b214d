//! Listening sessions and their registry.
//!
//! A [`Session`] ties together everything one room needs: a [`Sequencer`]
//! (with its [`Selector`]), a [`PlaybackMachine`] around the room's audio
//! output, and the observable [`PlayerState`]. A background driver task
//! feeds output status into the machine and advances to the next track
//! whenever the output stays idle.
//!
//! [`Sessions`] is the registry: at most one session per room, created on
//! first use and destroyed explicitly or when nobody is left in the room.
//!
//! # Example
//!
//! ```no_run
//! use jukebox::{config::Config, provider::Services, session::Sessions};
//!
//! # async fn example(services: Services) -> jukebox::error::Result<()> {
//! let sessions = Sessions::new(Config::default(), services);
//! let session = sessions.get_or_create(&"room".into())?;
//! session.enqueue(&"dQw4w9WgXcQ".into(), &"someone".into()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Selector`]: crate::shuffle::Selector

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::Caches,
    config::Config,
    error::{Error, Result},
    events::Event,
    media::MediaLibrary,
    metadata::MetadataService,
    playback::{PlaybackMachine, PlaybackState},
    provider::{OutputStatus, Services},
    queue::Sequencer,
    shuffle::Selector,
    state::{PlayerState, StateChange, StateHolder},
    track::{ParticipantId, PlayRecord, PlaylistEntry, RoomId, Track, TrackId},
    util::Clock,
};

/// How many unplayable tracks an advance skips before giving up.
const MAX_ADVANCE_ATTEMPTS: usize = 3;

/// What is playing right now.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NowPlaying {
    pub entry: PlaylistEntry,
    pub track: Option<Track>,
    pub elapsed_secs: u64,
    pub total_secs: Option<u64>,
}

/// Who is responsible for the current track.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Blame {
    pub entry: PlaylistEntry,
    pub track: Option<Track>,

    /// Everyone who ever played the track in this room.
    pub players: Vec<ParticipantId>,
}

/// Play count of one track in a room.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackStats {
    pub id: TrackId,
    pub title: String,
    pub plays: u64,
}

/// Process-wide parts shared by all sessions.
#[derive(Clone, Debug)]
struct Shared {
    config: Config,
    services: Services,
    caches: Caches,
    metadata: MetadataService,
    media: MediaLibrary,
}

/// The listening session of one room.
pub struct Session {
    room: RoomId,
    shared: Shared,
    sequencer: Sequencer,
    machine: PlaybackMachine,
    state: StateHolder,

    /// Serializes advances.
    advancing: tokio::sync::Mutex<()>,

    shutdown: CancellationToken,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("room", &self.room)
            .field("sequencer", &self.sequencer)
            .field("machine", &self.machine)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens the room's output and starts the driver.
    fn start(room: RoomId, shared: Shared) -> Result<Arc<Self>> {
        let (output, status_rx) = shared.services.outputs.open(&room)?;

        let selector = Selector::new(
            room.clone(),
            shared.config.shuffle.clone(),
            Arc::clone(&shared.services.participants),
            Arc::clone(&shared.services.plays),
            shared.media.clone(),
            &shared.caches,
            shared.config.cache.plays_ttl(),
        );
        selector.warm_up();
        let sequencer = Sequencer::new(selector);

        let (machine, long_idle_rx) = PlaybackMachine::new(
            output,
            shared.config.playback.idle_debounce(),
            Arc::clone(shared.caches.clock()),
        );

        let state = StateHolder::new(PlayerState {
            shuffle: sequencer.shuffle_enabled(),
            ..PlayerState::default()
        });

        let session = Arc::new(Self {
            room,
            shared,
            sequencer,
            machine,
            state,
            advancing: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(drive(
            Arc::downgrade(&session),
            session.shutdown.clone(),
            status_rx,
            long_idle_rx,
        ));

        info!("started session for room {}", session.room);
        Ok(session)
    }

    #[must_use]
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Advances to the next track and plays it.
    ///
    /// Advances never overlap. Tracks whose audio cannot be resolved are
    /// skipped, a few at most. When there is nothing to play the output is
    /// paused and `Ok(None)` returned.
    ///
    /// # Errors
    ///
    /// Returns the last error when no track could be played. Nothing is
    /// current afterwards, so the next request starts playing right away.
    pub async fn play_next(&self) -> Result<Option<PlaylistEntry>> {
        let _advancing = self.advancing.lock().await;

        let result = self.advance_and_play().await;
        if result.is_err() {
            self.sequencer.clear_current();
            self.state.set_state(StateChange::Current {
                entry: None,
                metadata: None,
            });
        }
        result
    }

    async fn advance_and_play(&self) -> Result<Option<PlaylistEntry>> {
        let mut last_error = None;
        for _ in 0..MAX_ADVANCE_ATTEMPTS {
            let entry = self.sequencer.advance().await;
            self.publish_queue();

            let Some(entry) = entry else {
                info!("nothing to play in room {}", self.room);
                self.state.set_state(StateChange::Current {
                    entry: None,
                    metadata: None,
                });
                self.state.announce(Event::NothingToPlay);
                if let Err(e) = self.machine.pause() {
                    warn!("failed to pause room {}: {e}", self.room);
                }
                return Ok(None);
            };

            let track = self.shared.metadata.get_or_log(&entry.id).await;
            let loudness = track.as_ref().and_then(|track| track.loudness);
            self.state.set_state(StateChange::Current {
                entry: Some(entry.clone()),
                metadata: track,
            });

            match self.shared.media.resolve(&entry.id, loudness).await {
                Ok(media) => {
                    self.machine.play(&media)?;
                    self.state
                        .set_state(StateChange::StartedAt(self.machine.started_at_ms()));
                    return Ok(Some(entry));
                }
                Err(e) => {
                    warn!("skipping unplayable {entry}: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::internal("no advance was attempted")))
    }

    /// Queues `id` on behalf of `requester` and logs the play.
    ///
    /// Starts playing right away when nothing plays or the current track
    /// was shuffled.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] for tracks without metadata, or the
    /// error of starting playback.
    ///
    /// [`ErrorKind::NotFound`]: crate::error::ErrorKind::NotFound
    pub async fn enqueue(&self, id: &TrackId, requester: &ParticipantId) -> Result<Track> {
        let track = self.shared.metadata.get(id).await?;
        let interrupt = self.sequencer.current().is_none() || self.sequencer.currently_shuffling();

        self.sequencer.enqueue_explicit(id.clone(), requester.clone());
        self.publish_queue();

        let record = PlayRecord {
            track: track.clone(),
            participant: requester.clone(),
            room: self.room.clone(),
            timestamp: self.clock().now_millis(),
            imported: false,
        };
        if let Err(e) = self.shared.services.plays.persist_play_record(record).await {
            error!("failed to log play of {id} in room {}: {e}", self.room);
        }
        self.sequencer.selector().invalidate_plays();

        if interrupt {
            self.play_next().await?;
        }
        Ok(track)
    }

    /// Logs a skip of the current track by `participant` and advances.
    ///
    /// # Errors
    ///
    /// Returns the error of starting the next track.
    pub async fn skip(&self, participant: &ParticipantId) -> Result<Option<PlaylistEntry>> {
        if let Some(current) = self.sequencer.current() {
            let timestamp = self.clock().now_millis();
            if let Err(e) = self
                .shared
                .services
                .plays
                .persist_skip(&current.id, participant, &self.room, timestamp)
                .await
            {
                error!("failed to log skip of {} in room {}: {e}", current.id, self.room);
            }
        }

        self.play_next().await
    }

    /// Removes every queued request for `id`.
    pub fn remove_from_queue(&self, id: &TrackId) -> usize {
        let removed = self.sequencer.remove_from_queue(id);
        self.publish_queue();
        removed
    }

    /// # Errors
    ///
    /// Returns the audio output's error.
    pub fn pause(&self) -> Result<()> {
        self.machine.pause()
    }

    /// # Errors
    ///
    /// Returns the audio output's error.
    pub fn unpause(&self) -> Result<()> {
        self.machine.unpause()
    }

    pub fn set_shuffle(&self, enabled: bool) {
        self.sequencer.set_shuffle_enabled(enabled);
        self.state.set_state(StateChange::Shuffle(enabled));
    }

    #[must_use]
    pub fn shuffle_enabled(&self) -> bool {
        self.sequencer.shuffle_enabled()
    }

    #[must_use]
    pub fn queue(&self) -> Vec<PlaylistEntry> {
        self.sequencer.snapshot()
    }

    #[must_use]
    pub fn playback_state(&self) -> PlaybackState {
        self.machine.state()
    }

    pub async fn now_playing(&self) -> Option<NowPlaying> {
        let entry = self.sequencer.current()?;
        let track = self.shared.metadata.get_or_log(&entry.id).await;
        let total_secs = track
            .as_ref()
            .and_then(Track::duration)
            .map(|duration| duration.as_secs());

        Some(NowPlaying {
            entry,
            track,
            elapsed_secs: self.machine.elapsed().as_secs(),
            total_secs,
        })
    }

    /// Who ever played the current track here.
    ///
    /// # Errors
    ///
    /// Returns the play store's error.
    pub async fn blame(&self) -> Result<Option<Blame>> {
        let Some(entry) = self.sequencer.current() else {
            return Ok(None);
        };

        let candidates = self.sequencer.selector().candidates().await?;
        let players = candidates
            .into_iter()
            .find(|candidate| candidate.id == entry.id)
            .map(|candidate| candidate.players.into_iter().collect())
            .unwrap_or_default();
        let track = self.shared.metadata.get_or_log(&entry.id).await;

        Ok(Some(Blame {
            entry,
            track,
            players,
        }))
    }

    /// The `limit` most played tracks in this room.
    ///
    /// # Errors
    ///
    /// Returns the play store's error.
    pub async fn stats(&self, limit: usize) -> Result<Vec<TrackStats>> {
        let candidates = self.sequencer.selector().candidates().await?;
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|candidate| TrackStats {
                id: candidate.id,
                title: candidate.title,
                plays: candidate.num_plays,
            })
            .collect())
    }

    /// Stores plays from an older history as imported plays of this room.
    ///
    /// # Errors
    ///
    /// Returns the first error of the play store; earlier records stay
    /// stored.
    pub async fn import_history(&self, records: Vec<PlayRecord>) -> Result<usize> {
        let mut imported = 0;
        for mut record in records {
            record.room = self.room.clone();
            record.imported = true;
            self.shared.metadata.remember(record.track.clone());
            self.shared.services.plays.persist_play_record(record).await?;
            imported += 1;
        }

        self.sequencer.selector().invalidate_plays();
        info!("imported {imported} plays into room {}", self.room);
        Ok(imported)
    }

    #[must_use]
    pub fn state(&self) -> PlayerState {
        self.state.snapshot()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.state.events()
    }

    fn handle_status(&self, status: OutputStatus) {
        let state = self.machine.handle_status(status);
        self.state
            .set_state(StateChange::Playing(state == PlaybackState::Playing));
    }

    fn publish_queue(&self) {
        self.state.set_state(StateChange::Queue(self.sequencer.snapshot()));
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.shared.caches.clock()
    }

    fn stop(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.machine.stop() {
            warn!("failed to stop output of room {}: {e}", self.room);
        }
        info!("stopped session for room {}", self.room);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Feeds output status into the session and advances on long idle.
async fn drive(
    session: Weak<Session>,
    shutdown: CancellationToken,
    mut status_rx: mpsc::UnboundedReceiver<OutputStatus>,
    mut long_idle_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,

            Some(status) = status_rx.recv() => {
                let Some(session) = session.upgrade() else { break };
                session.handle_status(status);
            }

            Some(()) = long_idle_rx.recv() => {
                let Some(session) = session.upgrade() else { break };
                debug!("room {} went idle, advancing", session.room);
                if let Err(e) = session.play_next().await {
                    error!("failed to advance room {}: {e}", session.room);
                }
            }

            else => break,
        }
    }

    trace!("session driver stopped");
}

/// At most one [`Session`] per room.
pub struct Sessions {
    shared: Shared,
    sessions: Mutex<HashMap<RoomId, Arc<Session>>>,
}

impl fmt::Debug for Sessions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sessions")
            .field("rooms", &self.rooms())
            .finish_non_exhaustive()
    }
}

impl Sessions {
    /// A registry whose caches persist as configured.
    #[must_use]
    pub fn new(config: Config, services: Services) -> Self {
        let caches = Caches::persistent(config.cache.clone());
        Self::with_caches(config, services, caches)
    }

    #[must_use]
    pub fn with_caches(config: Config, services: Services, caches: Caches) -> Self {
        let metadata = MetadataService::open(
            Arc::clone(&services.metadata),
            &caches,
            config.cache.metadata_ttl(),
        );
        let media = MediaLibrary::new(Arc::clone(&services.media), config.playback.target_lufs);

        Self {
            shared: Shared {
                config,
                services,
                caches,
                metadata,
                media,
            },
            sessions: Mutex::default(),
        }
    }

    /// Returns the session of `room`, starting one if there is none.
    ///
    /// # Errors
    ///
    /// Returns the error of opening the room's audio output.
    pub fn get_or_create(&self, room: &RoomId) -> Result<Arc<Session>> {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get(room) {
            return Ok(Arc::clone(session));
        }

        let session = Session::start(room.clone(), self.shared.clone())?;
        sessions.insert(room.clone(), Arc::clone(&session));
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, room: &RoomId) -> Option<Arc<Session>> {
        self.lock().get(room).cloned()
    }

    /// Stops and forgets the session of `room`, returning whether there was
    /// one.
    pub fn destroy(&self, room: &RoomId) -> bool {
        let session = self.lock().remove(room);
        session.inspect(|session| session.stop()).is_some()
    }

    /// Destroys the sessions of rooms nobody is in anymore, returning how
    /// many.
    pub async fn reap_empty(&self) -> usize {
        let mut reaped = 0;
        for room in self.rooms() {
            match self
                .shared
                .services
                .participants
                .fetch_room_participants(&room)
                .await
            {
                Ok(participants) if participants.is_empty() => {
                    if self.destroy(&room) {
                        reaped += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("failed to list participants of room {room}: {e}"),
            }
        }
        reaped
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        self.lock().keys().cloned().collect()
    }

    /// Stops every session.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.lock().drain().collect();
        for (_, session) in sessions {
            session.stop();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RoomId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
