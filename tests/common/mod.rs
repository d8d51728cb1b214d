//! Fixtures shared by the integration tests.
//!
//! Everything is in memory: plays live in a [`MemoryPlayStore`], the roster
//! in [`StaticParticipants`], and every room gets a [`RecordingOutput`] that
//! remembers its commands and lets a test report status by hand.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use jukebox::{
    cache::Caches,
    config::Config,
    error::{Error, Result},
    local::{MemoryPlayStore, StaticParticipants},
    provider::{
        AudioOutput, MediaHandle, MediaProvider, OutputProvider, OutputStatus, Services,
    },
    session::{Session, Sessions},
    state::PlayerState,
    track::{ParticipantId, PlayRecord, RoomId, Track, TrackId},
    util::ManualClock,
};

/// Wall clock of every test: November 2023.
pub const NOW: u64 = 1_700_000_000_000;

pub const ROOM: &str = "room";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Play(TrackId),
    Pause,
    Unpause,
    Stop,
}

/// An audio output that does what it is told instantly.
#[derive(Debug)]
pub struct RecordingOutput {
    commands: Mutex<Vec<Command>>,
    status: mpsc::UnboundedSender<OutputStatus>,
}

impl RecordingOutput {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn played(&self) -> Vec<TrackId> {
        self.commands()
            .into_iter()
            .filter_map(|command| match command {
                Command::Play(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Reports `status` as if the transport had sent it.
    pub fn report(&self, status: OutputStatus) {
        self.status.send(status).unwrap();
    }

    fn push(&self, command: Command, status: OutputStatus) -> Result<()> {
        self.commands.lock().unwrap().push(command);
        let _ = self.status.send(status);
        Ok(())
    }
}

impl AudioOutput for RecordingOutput {
    fn play(&self, media: &MediaHandle) -> Result<()> {
        self.push(Command::Play(media.track.clone()), OutputStatus::Playing)
    }

    fn pause(&self) -> Result<()> {
        self.push(Command::Pause, OutputStatus::Paused)
    }

    fn unpause(&self) -> Result<()> {
        self.push(Command::Unpause, OutputStatus::Playing)
    }

    fn stop(&self) -> Result<()> {
        self.push(Command::Stop, OutputStatus::Idle)
    }
}

#[derive(Debug, Default)]
pub struct RecordingOutputs {
    rooms: Mutex<HashMap<RoomId, Arc<RecordingOutput>>>,
}

impl RecordingOutputs {
    pub fn output(&self, room: &str) -> Arc<RecordingOutput> {
        Arc::clone(&self.rooms.lock().unwrap()[&RoomId::from(room)])
    }
}

impl OutputProvider for RecordingOutputs {
    fn open(
        &self,
        room: &RoomId,
    ) -> Result<(Arc<dyn AudioOutput>, mpsc::UnboundedReceiver<OutputStatus>)> {
        let (status, status_rx) = mpsc::unbounded_channel();
        let output = Arc::new(RecordingOutput {
            commands: Mutex::default(),
            status,
        });
        self.rooms
            .lock()
            .unwrap()
            .insert(room.clone(), Arc::clone(&output));
        Ok((output, status_rx))
    }
}

/// Resolves every track except the ones it is told are broken.
#[derive(Debug, Default)]
pub struct FakeMedia {
    broken: Mutex<HashSet<TrackId>>,
}

impl FakeMedia {
    pub fn break_track(&self, id: &str) {
        self.broken.lock().unwrap().insert(id.into());
    }
}

#[async_trait]
impl MediaProvider for FakeMedia {
    async fn resolve_playable_audio(&self, track: &TrackId) -> Result<MediaHandle> {
        if self.broken.lock().unwrap().contains(track) {
            return Err(Error::unavailable(format!("{track} failed to download")));
        }
        Ok(MediaHandle {
            track: track.clone(),
            location: format!("memory://{track}"),
            gain_db: 0.0,
        })
    }
}

pub struct Fixture {
    pub sessions: Sessions,
    pub store: Arc<MemoryPlayStore>,
    pub participants: Arc<StaticParticipants>,
    pub outputs: Arc<RecordingOutputs>,
    pub media: Arc<FakeMedia>,
    pub clock: ManualClock,
}

impl Fixture {
    pub fn new(records: Vec<PlayRecord>, present: &[&str]) -> Self {
        let store = Arc::new(MemoryPlayStore::with_records(records));
        let participants = Arc::new(StaticParticipants::new(
            present.iter().map(|&participant| participant.into()).collect(),
        ));
        let outputs = Arc::new(RecordingOutputs::default());
        let media = Arc::new(FakeMedia::default());
        let clock = ManualClock::starting_at(NOW);

        let services = Services {
            media: Arc::clone(&media) as _,
            metadata: Arc::clone(&store) as _,
            participants: Arc::clone(&participants) as _,
            plays: Arc::clone(&store) as _,
            outputs: Arc::clone(&outputs) as _,
        };
        let caches = Caches::in_memory().with_clock(Arc::new(clock.clone()));

        Self {
            sessions: Sessions::with_caches(Config::default(), services, caches),
            store,
            participants,
            outputs,
            media,
            clock,
        }
    }

    pub fn session(&self) -> Arc<Session> {
        self.sessions.get_or_create(&ROOM.into()).unwrap()
    }

    pub fn output(&self) -> Arc<RecordingOutput> {
        self.outputs.output(ROOM)
    }
}

pub fn track(id: &str, duration_secs: f64) -> Track {
    Track::new(id, format!("{id} title"), format!("{id} author")).with_duration(duration_secs)
}

pub fn play(track: Track, participant: &str, timestamp: u64) -> PlayRecord {
    PlayRecord {
        track,
        participant: ParticipantId::from(participant),
        room: ROOM.into(),
        timestamp,
        imported: false,
    }
}

/// Waits until the session state satisfies `condition`.
pub async fn wait_for_state(session: &Session, condition: impl FnMut(&PlayerState) -> bool) {
    let mut state = session.subscribe();
    tokio::time::timeout(Duration::from_secs(10), state.wait_for(condition))
        .await
        .expect("state never reached")
        .unwrap();
}
