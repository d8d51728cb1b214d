//! Playback state of a room's audio output.
//!
//! The audio output reports what it is doing as [`OutputStatus`] updates;
//! [`PlaybackMachine`] folds them into a [`PlaybackState`] and detects when
//! the output has been idle for a while, which is how the end of a track is
//! noticed.
//!
//! # Long idle
//!
//! Entering [`PlaybackState::Idle`] arms a short debounce timer. If the
//! machine is still idle when it fires, one long-idle signal is sent on the
//! channel returned by [`PlaybackMachine::new`]. Leaving `Idle`, or starting
//! to play, disarms the timer. Entering `Idle` again while already idle
//! re-arms it, so a burst of idle reports yields a single signal.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, Instant},
};

use crate::{
    error::Result,
    provider::{AudioOutput, MediaHandle, OutputStatus},
    util::Clock,
};

/// What the audio output of a room is doing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    /// Paused because the output lost its target, resumes by itself.
    AutoPaused,
}

impl From<OutputStatus> for PlaybackState {
    fn from(status: OutputStatus) -> Self {
        match status {
            OutputStatus::Playing => Self::Playing,
            OutputStatus::Paused => Self::Paused,
            OutputStatus::AutoPaused => Self::AutoPaused,
            OutputStatus::Idle => Self::Idle,
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::AutoPaused => write!(f, "auto-paused"),
        }
    }
}

#[derive(Debug, Default)]
struct MachineState {
    state: PlaybackState,
    started_at: Option<Instant>,

    /// Epoch milliseconds of the last `play`, zero before the first.
    started_at_ms: u64,

    /// Bumped on every arm and disarm; a timer only fires for its own.
    idle_generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

/// Wraps an [`AudioOutput`] with explicit states and idle detection.
pub struct PlaybackMachine {
    output: Arc<dyn AudioOutput>,
    idle_debounce: Duration,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<MachineState>>,
    long_idle_tx: mpsc::UnboundedSender<()>,
}

impl fmt::Debug for PlaybackMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackMachine")
            .field("state", &self.state())
            .field("idle_debounce", &self.idle_debounce)
            .finish_non_exhaustive()
    }
}

impl Drop for PlaybackMachine {
    fn drop(&mut self) {
        if let Some(timer) = self.lock().idle_timer.take() {
            timer.abort();
        }
    }
}

impl PlaybackMachine {
    /// Creates a machine in [`PlaybackState::Idle`] and the receiving end of
    /// its long-idle signals.
    ///
    /// The initial state does not arm the timer: only reported idleness
    /// counts.
    #[must_use]
    pub fn new(
        output: Arc<dyn AudioOutput>,
        idle_debounce: Duration,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (long_idle_tx, long_idle_rx) = mpsc::unbounded_channel();
        let machine = Self {
            output,
            idle_debounce,
            clock,
            state: Arc::default(),
            long_idle_tx,
        };
        (machine, long_idle_rx)
    }

    /// Applies a status reported by the audio output and returns the new
    /// state.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime with an idle status.
    pub fn handle_status(&self, status: OutputStatus) -> PlaybackState {
        let new = PlaybackState::from(status);
        let mut state = self.lock();
        let previous = std::mem::replace(&mut state.state, new);
        if previous != new {
            debug!("playback {previous} -> {new}");
        }

        if new == PlaybackState::Idle {
            self.arm_idle_timer(&mut state);
        } else {
            Self::disarm_idle_timer(&mut state);
        }
        new
    }

    /// Starts playing `media` and marks the start time.
    ///
    /// # Errors
    ///
    /// Returns the audio output's error.
    pub fn play(&self, media: &MediaHandle) -> Result<()> {
        {
            let mut state = self.lock();
            Self::disarm_idle_timer(&mut state);
            state.started_at = Some(Instant::now());
            state.started_at_ms = self.clock.now_millis();
        }

        info!("playing {media}");
        self.output.play(media)
    }

    /// # Errors
    ///
    /// Returns the audio output's error.
    pub fn pause(&self) -> Result<()> {
        self.output.pause()
    }

    /// # Errors
    ///
    /// Returns the audio output's error.
    pub fn unpause(&self) -> Result<()> {
        self.output.unpause()
    }

    /// # Errors
    ///
    /// Returns the audio output's error.
    pub fn stop(&self) -> Result<()> {
        self.output.stop()
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.lock().state
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// Epoch milliseconds at which the current track started, zero if none
    /// ever did.
    #[must_use]
    pub fn started_at_ms(&self) -> u64 {
        self.lock().started_at_ms
    }

    /// Time since the current track started. Keeps counting while paused.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.lock()
            .started_at
            .map_or(Duration::ZERO, |started_at| started_at.elapsed())
    }

    fn arm_idle_timer(&self, state: &mut MachineState) {
        Self::disarm_idle_timer(state);
        let generation = state.idle_generation;

        let shared = Arc::clone(&self.state);
        let long_idle_tx = self.long_idle_tx.clone();
        let debounce = self.idle_debounce;
        state.idle_timer = Some(tokio::spawn(async move {
            sleep(debounce).await;

            let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if state.state == PlaybackState::Idle && state.idle_generation == generation {
                state.idle_timer = None;
                trace!("idle for {} ms", debounce.as_millis());
                // The receiver is gone only while the session shuts down.
                let _ = long_idle_tx.send(());
            }
        }));
    }

    fn disarm_idle_timer(state: &mut MachineState) {
        state.idle_generation += 1;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;

    #[derive(Debug, Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn record(&self, command: impl Into<String>) -> Result<()> {
            self.commands.lock().unwrap().push(command.into());
            Ok(())
        }
    }

    impl AudioOutput for Recorder {
        fn play(&self, media: &MediaHandle) -> Result<()> {
            self.record(format!("play {}", media.track))
        }

        fn pause(&self) -> Result<()> {
            self.record("pause")
        }

        fn unpause(&self) -> Result<()> {
            self.record("unpause")
        }

        fn stop(&self) -> Result<()> {
            self.record("stop")
        }
    }

    fn machine() -> (PlaybackMachine, mpsc::UnboundedReceiver<()>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let (machine, long_idle) = PlaybackMachine::new(
            Arc::clone(&recorder) as Arc<dyn AudioOutput>,
            Duration::from_secs(1),
            Arc::new(ManualClock::starting_at(42_000)),
        );
        (machine, long_idle, recorder)
    }

    fn media(id: &str) -> MediaHandle {
        MediaHandle {
            track: id.into(),
            location: format!("{id}.ogg"),
            gain_db: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn long_idle_fires_once() {
        let (machine, mut long_idle, _) = machine();
        assert_eq!(machine.state(), PlaybackState::Idle);

        machine.handle_status(OutputStatus::Idle);
        sleep(Duration::from_millis(1_500)).await;
        assert!(long_idle.try_recv().is_ok());

        sleep(Duration::from_secs(10)).await;
        assert!(long_idle.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn playing_suppresses_long_idle() {
        let (machine, mut long_idle, _) = machine();

        machine.handle_status(OutputStatus::Idle);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(machine.handle_status(OutputStatus::Playing), PlaybackState::Playing);

        sleep(Duration::from_secs(2)).await;
        assert!(long_idle.try_recv().is_err());
        assert!(machine.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn play_suppresses_long_idle() {
        let (machine, mut long_idle, recorder) = machine();

        machine.handle_status(OutputStatus::Idle);
        machine.play(&media("x")).unwrap();
        sleep(Duration::from_secs(2)).await;

        assert!(long_idle.try_recv().is_err());
        assert_eq!(recorder.commands(), ["play x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_idle_restarts_the_debounce() {
        let (machine, mut long_idle, _) = machine();

        machine.handle_status(OutputStatus::Idle);
        sleep(Duration::from_millis(700)).await;
        machine.handle_status(OutputStatus::Idle);
        sleep(Duration::from_millis(700)).await;
        assert!(long_idle.try_recv().is_err());

        sleep(Duration::from_millis(400)).await;
        assert!(long_idle.try_recv().is_ok());
        assert!(long_idle.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn paused_states_do_not_advance() {
        let (machine, mut long_idle, _) = machine();

        for status in [OutputStatus::Paused, OutputStatus::AutoPaused] {
            machine.handle_status(status);
            sleep(Duration::from_secs(5)).await;
            assert!(long_idle.try_recv().is_err());
        }
        assert_eq!(machine.state(), PlaybackState::AutoPaused);
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_start_time() {
        let (machine, _, recorder) = machine();
        assert_eq!(machine.started_at_ms(), 0);
        assert_eq!(machine.elapsed(), Duration::ZERO);

        machine.play(&media("x")).unwrap();
        machine.handle_status(OutputStatus::Playing);
        sleep(Duration::from_secs(3)).await;

        assert_eq!(machine.started_at_ms(), 42_000);
        let elapsed = machine.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3_010));

        machine.pause().unwrap();
        machine.unpause().unwrap();
        machine.stop().unwrap();
        assert_eq!(recorder.commands(), ["play x", "pause", "unpause", "stop"]);
    }
}
