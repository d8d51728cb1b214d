//! Weighted random recommendation of the next track.
//!
//! When the explicit queue runs dry, the selector picks something the room
//! is likely to enjoy from everything ever played there. The pipeline is:
//!
//! 1. **Recency**: drop tracks played within the history window.
//! 2. **Duration**: drop tracks outside `(min, max)`. Tracks of unknown
//!    length pass.
//! 3. **Audience**: drop tracks nobody currently present has ever played.
//! 4. **Participant diversity**: `players * participants_weight`.
//! 5. **Temporal spread**: `distinct months with a play * months_weight`,
//!    where months are counted back from now in twelfths of a year.
//! 6. **Duration shape**: a triangle peaking at the ideal duration and
//!    reaching zero at the bounds, times `duration_weight`, rounded.
//! 7. **Draw**: each candidate occupies as many slots of a virtual pool as
//!    its rounded total weight; one slot is drawn uniformly.
//!
//! # Lookahead
//!
//! Computing a pick loads and aggregates the room's plays and asks who is
//! present, which takes a while. As soon as [`Selector::get_next`] returns,
//! the following pick is computed in the background and its audio
//! prefetched, so the next call is usually answered from that slot. A slot
//! whose track got played in the meantime is discarded.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use ::rand::Rng;
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    cache::Caches,
    config::ShuffleConfig,
    error::Result,
    history::PlayHistory,
    lookup::CachedLookup,
    media::MediaLibrary,
    provider::{ParticipantProvider, PlayStore},
    rand::{draw_weighted, with_rng},
    track::{Candidate, ParticipantId, RoomId, TrackId},
    util::Clock,
};

/// A twelfth of a 365-day year.
pub const MONTH_MILLIS: u64 = 365 * 24 * 60 * 60 * 1000 / 12;

/// Triangular falloff: 0 at or beyond `min` and `max`, 1 at `ideal`,
/// linear in between.
#[must_use]
pub fn linear_falloff(value: f64, min: f64, ideal: f64, max: f64) -> f64 {
    if value <= min || value >= max {
        0.0
    } else if value < ideal {
        (value - min) / (ideal - min)
    } else {
        (max - value) / (max - ideal)
    }
}

/// Whether a track of `duration_secs` may be picked at all.
#[must_use]
pub fn duration_in_bounds(duration_secs: Option<f64>, config: &ShuffleConfig) -> bool {
    duration_secs.is_none_or(|secs| {
        secs > config.min_duration_secs && secs < config.max_duration_secs
    })
}

/// Number of distinct months, counted back from `now`, with at least one of
/// `timestamps`. Timestamps in the future count as this month.
#[must_use]
pub fn distinct_months(timestamps: &BTreeSet<u64>, now: u64) -> usize {
    timestamps
        .iter()
        .map(|ts| now.saturating_sub(*ts) / MONTH_MILLIS)
        .collect::<BTreeSet<_>>()
        .len()
}

/// Total draw weight of `candidate`: the number of pool slots it occupies.
#[must_use]
pub fn weight(candidate: &Candidate, config: &ShuffleConfig, now: u64) -> u64 {
    #[expect(clippy::cast_precision_loss)]
    let participants = candidate.played_by_count() as f64 * config.participants_weight;

    #[expect(clippy::cast_precision_loss)]
    let months = distinct_months(&candidate.timestamps, now) as f64 * config.months_weight;

    let shape = candidate.duration_secs.map_or(0.0, |secs| {
        let falloff = linear_falloff(
            secs,
            config.min_duration_secs,
            config.ideal_duration_secs,
            config.max_duration_secs,
        );
        (falloff * config.duration_weight).round()
    });

    to_slots((participants + months + shape).round())
}

/// Float to integer casts saturate, so this never wraps.
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_slots(total: f64) -> u64 {
    if total.is_finite() && total > 0.0 {
        total as u64
    } else {
        0
    }
}

/// Applies the three filters, keeping the order of `candidates`.
pub fn eligible<'a, F>(
    candidates: &'a [Candidate],
    present: &[ParticipantId],
    is_recent: F,
    config: &ShuffleConfig,
) -> Vec<&'a Candidate>
where
    F: Fn(&TrackId) -> bool,
{
    candidates
        .iter()
        .filter(|candidate| !is_recent(&candidate.id))
        .filter(|candidate| duration_in_bounds(candidate.duration_secs, config))
        .filter(|candidate| candidate.played_by_any(present))
        .collect()
}

/// Draws one of `eligible` proportionally to its [`weight`].
pub fn pick<'a, R>(
    rng: &mut R,
    eligible: &[&'a Candidate],
    config: &ShuffleConfig,
    now: u64,
) -> Option<&'a Candidate>
where
    R: Rng + ?Sized,
{
    let weights: Vec<u64> = eligible
        .iter()
        .map(|candidate| weight(candidate, config, now))
        .collect();
    draw_weighted(rng, &weights).map(|index| eligible[index])
}

#[derive(Debug, Default)]
struct Lookahead {
    /// Bumped whenever the slot is consumed, so stale computations are
    /// discarded instead of stored.
    generation: u64,
    pick: Option<Candidate>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    room: RoomId,
    config: ShuffleConfig,
    participants: Arc<dyn ParticipantProvider>,
    plays: Arc<dyn PlayStore>,
    media: MediaLibrary,
    history: PlayHistory,
    population: CachedLookup<Vec<Candidate>>,
    clock: Arc<dyn Clock>,
    lookahead: Mutex<Lookahead>,
}

/// The recommendation selector of one room.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<Inner>,
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("room", &self.inner.room)
            .field("precomputed", &self.precomputed())
            .finish_non_exhaustive()
    }
}

impl Selector {
    /// Opens the selector of `room`, with its history window and play
    /// population cached under the room's name.
    #[must_use]
    pub fn new(
        room: RoomId,
        config: ShuffleConfig,
        participants: Arc<dyn ParticipantProvider>,
        plays: Arc<dyn PlayStore>,
        media: MediaLibrary,
        caches: &Caches,
        plays_ttl: Duration,
    ) -> Self {
        let history = PlayHistory::open(&room, caches, config.history_window());
        let population = CachedLookup::new(caches.open(&format!("{room}-plays"), plays_ttl));

        Self {
            inner: Arc::new(Inner {
                room,
                config,
                participants,
                plays,
                media,
                history,
                population,
                clock: Arc::clone(caches.clock()),
                lookahead: Mutex::default(),
            }),
        }
    }

    /// Returns the next recommendation, or `None` when nothing qualifies.
    ///
    /// Never fails: errors anywhere in the pipeline are logged and yield
    /// `None`.
    pub async fn get_next(&self) -> Option<Candidate> {
        let precomputed = {
            let mut lookahead = self.lock();
            lookahead.generation += 1;
            lookahead.pick.take()
        };

        let pick = match precomputed {
            Some(candidate) if !self.inner.history.contains(&candidate.id) => {
                trace!("using precomputed shuffle pick {}", candidate.id);
                Some(candidate)
            }
            _ => self.compute(None).await,
        };

        self.start_lookahead(pick.as_ref().map(|candidate| candidate.id.clone()));
        pick
    }

    /// Starts computing a pick in the background without consuming one.
    pub fn warm_up(&self) {
        self.start_lookahead(None);
    }

    /// Excludes `id` for the length of the history window.
    pub fn record_played(&self, id: &TrackId) {
        self.inner.history.add(id);

        let mut lookahead = self.lock();
        if lookahead.pick.as_ref().is_some_and(|pick| pick.id == *id) {
            lookahead.pick = None;
        }
    }

    /// Whether `id` was played within the history window.
    #[must_use]
    pub fn recently_played(&self, id: &TrackId) -> bool {
        self.inner.history.contains(id)
    }

    /// Drops the cached play population so new plays are taken into account.
    pub fn invalidate_plays(&self) {
        self.inner.population.invalidate(self.inner.room.as_str());
    }

    /// The room's plays folded into candidates, most played first.
    ///
    /// # Errors
    ///
    /// Returns the play store's error.
    pub async fn candidates(&self) -> Result<Vec<Candidate>> {
        let plays = Arc::clone(&self.inner.plays);
        let room = self.inner.room.clone();
        self.inner
            .population
            .get_or_fetch(self.inner.room.as_str(), move || async move {
                let records = plays.load_play_records(&room).await?;
                Ok(Candidate::aggregate(
                    records.iter().filter(|record| record.room == room),
                ))
            })
            .await
    }

    /// The id sitting in the lookahead slot, if any.
    #[must_use]
    pub fn precomputed(&self) -> Option<TrackId> {
        self.lock().pick.as_ref().map(|pick| pick.id.clone())
    }

    /// Waits for the latest background computation to finish.
    pub async fn lookahead_settled(&self) {
        let task = self.lock().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("shuffle lookahead for room {} failed: {e}", self.inner.room);
            }
        }
    }

    fn start_lookahead(&self, exclude: Option<TrackId>) {
        let mut lookahead = self.lock();
        lookahead.generation += 1;
        let generation = lookahead.generation;

        let selector = self.clone();
        lookahead.task = Some(tokio::spawn(async move {
            let pick = selector.compute(exclude.as_ref()).await;
            if let Some(candidate) = &pick {
                selector
                    .inner
                    .media
                    .prefetch(candidate.id.clone(), candidate.loudness);
            }

            let mut lookahead = selector.lock();
            if lookahead.generation == generation {
                lookahead.pick = pick;
            }
        }));
    }

    async fn compute(&self, exclude: Option<&TrackId>) -> Option<Candidate> {
        let started = Instant::now();
        match self.try_compute(exclude).await {
            Ok(pick) => {
                debug!(
                    "computed next shuffle pick for room {} in {} ms: {}",
                    self.inner.room,
                    started.elapsed().as_millis(),
                    pick.as_ref()
                        .map_or_else(|| "none".to_owned(), |pick| pick.id.to_string())
                );
                pick
            }
            Err(e) => {
                warn!("shuffle for room {} failed: {e}", self.inner.room);
                None
            }
        }
    }

    async fn try_compute(&self, exclude: Option<&TrackId>) -> Result<Option<Candidate>> {
        let candidates = self.candidates().await?;
        let present = self
            .inner
            .participants
            .fetch_room_participants(&self.inner.room)
            .await?;

        let now = self.inner.clock.now_millis();
        let history = &self.inner.history;
        let eligible = eligible(
            &candidates,
            &present,
            |id| history.contains(id) || exclude == Some(id),
            &self.inner.config,
        );
        trace!(
            "{} of {} candidates eligible in room {}",
            eligible.len(),
            candidates.len(),
            self.inner.room
        );

        Ok(with_rng(|rng| pick(rng, &eligible, &self.inner.config, now)).cloned())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lookahead> {
        self.inner
            .lookahead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use ::rand::{rngs::SmallRng, SeedableRng};
    use async_trait::async_trait;

    use super::*;
    use crate::{
        error::Error,
        local::{MemoryPlayStore, StaticParticipants},
        provider::{MediaHandle, MediaProvider},
        track::{PlayRecord, Track},
        util::ManualClock,
    };

    const NOW: u64 = 100 * MONTH_MILLIS;

    fn candidate(id: &str, players: &[&str], duration_secs: Option<f64>) -> Candidate {
        Candidate {
            id: id.into(),
            title: id.to_owned(),
            duration_secs,
            loudness: None,
            players: players.iter().map(|player| (*player).into()).collect(),
            timestamps: BTreeSet::from([NOW]),
            num_plays: 1,
        }
    }

    fn present(participants: &[&str]) -> Vec<ParticipantId> {
        participants.iter().map(|participant| (*participant).into()).collect()
    }

    #[test]
    fn falloff_is_triangular() {
        let falloff = |value| linear_falloff(value, 60.0, 270.0, 900.0);
        assert!(falloff(60.0).abs() < f64::EPSILON);
        assert!(falloff(900.0).abs() < f64::EPSILON);
        assert!(falloff(10_000.0).abs() < f64::EPSILON);
        assert!((falloff(270.0) - 1.0).abs() < f64::EPSILON);
        assert!((falloff(165.0) - 0.5).abs() < f64::EPSILON);
        assert!((falloff(585.0) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn duration_bounds_are_exclusive() {
        let config = ShuffleConfig::default();
        assert!(duration_in_bounds(None, &config));
        assert!(duration_in_bounds(Some(61.0), &config));
        assert!(!duration_in_bounds(Some(60.0), &config));
        assert!(!duration_in_bounds(Some(900.0), &config));
        assert!(!duration_in_bounds(Some(200_000.0), &config));
    }

    #[test]
    fn counts_distinct_months_back_from_now() {
        let day = MONTH_MILLIS / 30;
        let timestamps = BTreeSet::from([NOW, NOW - day, NOW - 40 * day, NOW + day]);
        assert_eq!(distinct_months(&timestamps, NOW), 2);
    }

    #[test]
    fn weighs_players_months_and_shape() {
        let config = ShuffleConfig::default();
        let mut track = candidate("x", &["a", "b"], Some(270.0));
        track.timestamps.insert(NOW - 2 * MONTH_MILLIS);

        // 2 players * 4 + 2 months * 4 + 1.0 * 10
        assert_eq!(weight(&track, &config, NOW), 26);

        track.duration_secs = None;
        assert_eq!(weight(&track, &config, NOW), 16);
    }

    #[test]
    fn filters_by_audience_and_duration() {
        let config = ShuffleConfig::default();
        let candidates = [
            candidate("x", &["a"], Some(200.0)),
            candidate("y", &["b"], Some(200_000.0)),
            candidate("z", &["c"], Some(200.0)),
        ];

        let eligible = eligible(&candidates, &present(&["a", "b"]), |_| false, &config);
        let ids: Vec<_> = eligible.iter().map(|candidate| candidate.id.as_str()).collect();
        assert_eq!(ids, ["x"]);

        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(pick(&mut rng, &eligible, &config, NOW).unwrap().id.as_str(), "x");
        }
    }

    #[test]
    fn recent_tracks_are_never_picked() {
        let config = ShuffleConfig::default();
        let candidates = [
            candidate("x", &["a"], Some(200.0)),
            candidate("y", &["a"], Some(200.0)),
        ];
        let recent: TrackId = "x".into();

        let eligible = eligible(&candidates, &present(&["a"]), |id| *id == recent, &config);
        let mut rng = SmallRng::seed_from_u64(2);
        for _ in 0..1_000 {
            assert_eq!(pick(&mut rng, &eligible, &config, NOW).unwrap().id.as_str(), "y");
        }
    }

    #[test]
    fn weightless_tracks_are_never_picked() {
        let config = ShuffleConfig {
            participants_weight: 0.0,
            months_weight: 0.0,
            ..ShuffleConfig::default()
        };
        let candidates = [
            candidate("unknown-length", &["a"], None),
            candidate("ideal", &["a"], Some(270.0)),
        ];
        let eligible = eligible(&candidates, &present(&["a"]), |_| false, &config);
        assert_eq!(eligible.len(), 2);

        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..1_000 {
            assert_eq!(pick(&mut rng, &eligible, &config, NOW).unwrap().id.as_str(), "ideal");
        }

        let weightless = [&candidates[0]];
        assert!(pick(&mut rng, &weightless, &config, NOW).is_none());
    }

    #[test]
    fn heavier_tracks_are_picked_more_often() {
        let config = ShuffleConfig::default();
        let candidates = [
            candidate("light", &["a"], Some(200.0)),
            candidate("heavy", &["a", "b", "c"], Some(200.0)),
        ];
        let eligible = eligible(&candidates, &present(&["a"]), |_| false, &config);

        let mut rng = SmallRng::seed_from_u64(4);
        let heavy = (0..10_000)
            .filter(|_| pick(&mut rng, &eligible, &config, NOW).unwrap().id.as_str() == "heavy")
            .count();
        assert!(heavy > 5_000, "heavy picked {heavy} times");
    }

    #[test]
    fn empty_pool_picks_nothing() {
        let mut rng = SmallRng::seed_from_u64(5);
        assert!(pick(&mut rng, &[], &ShuffleConfig::default(), NOW).is_none());
    }

    struct NoMedia;

    #[async_trait]
    impl MediaProvider for NoMedia {
        async fn resolve_playable_audio(&self, track: &TrackId) -> Result<MediaHandle> {
            Err(Error::unimplemented(format!("no audio for {track}")))
        }
    }

    fn record(track: &str, participant: &str, duration_secs: f64) -> PlayRecord {
        PlayRecord {
            track: Track::new(track, track, "someone").with_duration(duration_secs),
            participant: participant.into(),
            room: "room".into(),
            timestamp: NOW,
            imported: false,
        }
    }

    fn open_selector(
        records: Vec<PlayRecord>,
        participants: &[&str],
    ) -> (Selector, Arc<MemoryPlayStore>) {
        open_selector_at(records, participants, &ManualClock::starting_at(NOW))
    }

    fn open_selector_at(
        records: Vec<PlayRecord>,
        participants: &[&str],
        clock: &ManualClock,
    ) -> (Selector, Arc<MemoryPlayStore>) {
        let store = Arc::new(MemoryPlayStore::with_records(records));
        let caches = Caches::in_memory().with_clock(Arc::new(clock.clone()));
        let selector = Selector::new(
            "room".into(),
            ShuffleConfig::default(),
            Arc::new(StaticParticipants::new(present(participants))),
            Arc::clone(&store) as Arc<dyn PlayStore>,
            MediaLibrary::new(Arc::new(NoMedia), -14.0),
            &caches,
            Duration::from_secs(600),
        );
        (selector, store)
    }

    #[tokio::test]
    async fn picks_what_the_audience_knows() {
        let (selector, _) = open_selector(
            vec![record("x", "a", 200.0), record("y", "b", 200_000.0)],
            &["a", "b"],
        );
        assert_eq!(selector.get_next().await.unwrap().id.as_str(), "x");
    }

    #[tokio::test]
    async fn looks_ahead_past_the_current_pick() {
        let (selector, _) = open_selector(
            vec![record("x", "a", 200.0), record("y", "a", 200.0)],
            &["a"],
        );

        let first = selector.get_next().await.unwrap();
        selector.record_played(&first.id);
        selector.lookahead_settled().await;

        let precomputed = selector.precomputed().unwrap();
        assert_ne!(precomputed, first.id);

        let second = selector.get_next().await.unwrap();
        assert_eq!(second.id, precomputed);
        selector.record_played(&second.id);
        selector.lookahead_settled().await;

        // Both tracks are in the history window now.
        assert!(selector.precomputed().is_none());
        assert!(selector.get_next().await.is_none());
    }

    #[tokio::test]
    async fn played_tracks_return_after_the_history_window() {
        let clock = ManualClock::starting_at(NOW);
        let (selector, _) = open_selector_at(vec![record("x", "a", 200.0)], &["a"], &clock);

        let first = selector.get_next().await.unwrap();
        assert_eq!(first.id.as_str(), "x");
        selector.record_played(&first.id);
        selector.lookahead_settled().await;
        assert!(selector.get_next().await.is_none());

        clock.advance(ShuffleConfig::default().history_window());
        selector.lookahead_settled().await;
        assert!(selector.get_next().await.is_none(), "excluded up to the window");

        clock.advance(Duration::from_secs(1));
        selector.lookahead_settled().await;
        assert!(!selector.recently_played(&first.id));
        assert_eq!(selector.get_next().await.unwrap().id.as_str(), "x");
    }

    #[tokio::test]
    async fn stale_lookahead_is_discarded() {
        let (selector, _) = open_selector(
            vec![record("x", "a", 200.0), record("y", "a", 200.0)],
            &["a"],
        );

        selector.warm_up();
        selector.lookahead_settled().await;
        let precomputed = selector.precomputed().unwrap();

        selector.record_played(&precomputed);
        assert!(selector.precomputed().is_none());
        assert_ne!(selector.get_next().await.unwrap().id, precomputed);
    }

    #[tokio::test]
    async fn new_plays_need_invalidation() {
        let (selector, store) = open_selector(vec![record("x", "a", 200.0)], &["a"]);
        assert_eq!(selector.candidates().await.unwrap().len(), 1);

        store
            .persist_play_record(record("y", "a", 200.0))
            .await
            .unwrap();
        assert_eq!(selector.candidates().await.unwrap().len(), 1);

        selector.invalidate_plays();
        assert_eq!(selector.candidates().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failures_yield_nothing() {
        struct Offline;

        #[async_trait]
        impl ParticipantProvider for Offline {
            async fn fetch_room_participants(&self, _: &RoomId) -> Result<Vec<ParticipantId>> {
                Err(Error::unavailable("gateway down"))
            }
        }

        let caches = Caches::in_memory();
        let selector = Selector::new(
            "room".into(),
            ShuffleConfig::default(),
            Arc::new(Offline),
            Arc::new(MemoryPlayStore::with_records(vec![record("x", "a", 200.0)])),
            MediaLibrary::new(Arc::new(NoMedia), -14.0),
            &caches,
            Duration::from_secs(600),
        );
        assert!(selector.get_next().await.is_none());
    }
}
