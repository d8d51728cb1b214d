//! Tracks, plays and the values derived from them.
//!
//! Identities are opaque strings owned by external systems: a [`TrackId`]
//! is whatever the media platform calls a track, a [`ParticipantId`] whatever
//! the chat platform calls a user, and a [`RoomId`] whatever it calls a
//! listening room. Newtypes keep them from being mixed up.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    time::Duration,
};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque media id of a track.
    TrackId
);
string_id!(
    /// Identity of someone taking part in a room.
    ParticipantId
);
string_id!(
    /// Identity of a listening room.
    RoomId
);

/// A track with its display and playback attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub author: String,

    /// Title and author as matched in an external catalog, preferred for
    /// display when present.
    #[serde(default)]
    pub catalog_title: Option<String>,
    #[serde(default)]
    pub catalog_author: Option<String>,

    /// Length in seconds, when known.
    #[serde(default)]
    pub duration_secs: Option<f64>,

    /// Integrated loudness in LUFS, when measured.
    #[serde(default)]
    pub loudness: Option<f32>,
}

impl Track {
    #[must_use]
    pub fn new(id: impl Into<TrackId>, title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            author: author.into(),
            catalog_title: None,
            catalog_author: None,
            duration_secs: None,
            loudness: None,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn display_title(&self) -> &str {
        self.catalog_title
            .as_deref()
            .filter(|title| !title.is_empty())
            .unwrap_or(&self.title)
    }

    #[must_use]
    pub fn display_author(&self) -> &str {
        self.catalog_author
            .as_deref()
            .filter(|author| !author.is_empty())
            .unwrap_or(&self.author)
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: \"{} - {}\"",
            self.id,
            self.display_author(),
            self.display_title()
        )
    }
}

/// The fact that a participant played a track in a room.
///
/// Records are append-only. `imported` marks plays that were bulk-loaded
/// from an older history rather than requested live.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayRecord {
    pub track: Track,
    pub participant: ParticipantId,
    pub room: RoomId,

    /// Epoch milliseconds.
    pub timestamp: u64,

    #[serde(default)]
    pub imported: bool,
}

/// One slot of the explicit queue.
///
/// `requester` is `None` for entries chosen by the shuffle.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub id: TrackId,
    pub requester: Option<ParticipantId>,
}

impl PlaylistEntry {
    #[must_use]
    pub fn requested(id: TrackId, requester: ParticipantId) -> Self {
        Self {
            id,
            requester: Some(requester),
        }
    }

    #[must_use]
    pub fn shuffled(id: TrackId) -> Self {
        Self {
            id,
            requester: None,
        }
    }

    #[must_use]
    pub fn is_shuffled(&self) -> bool {
        self.requester.is_none()
    }
}

impl fmt::Display for PlaylistEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.requester {
            Some(requester) => write!(f, "{} (requested by {requester})", self.id),
            None => write!(f, "{} (shuffled)", self.id),
        }
    }
}

/// All plays of one track in a room, folded together.
///
/// This is the unit the shuffle filters and weighs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: TrackId,
    pub title: String,
    pub duration_secs: Option<f64>,
    pub loudness: Option<f32>,

    /// Everyone who ever played the track here.
    pub players: BTreeSet<ParticipantId>,

    /// Distinct play timestamps in epoch milliseconds.
    pub timestamps: BTreeSet<u64>,

    pub num_plays: u64,
}

impl Candidate {
    /// Folds play records into one candidate per track, most played first.
    ///
    /// Ties keep the order in which tracks were first seen so the result is
    /// stable for a given input.
    #[must_use]
    pub fn aggregate<'a, I>(records: I) -> Vec<Candidate>
    where
        I: IntoIterator<Item = &'a PlayRecord>,
    {
        let mut index: HashMap<&TrackId, usize> = HashMap::new();
        let mut candidates: Vec<Candidate> = Vec::new();

        for record in records {
            let position = *index.entry(&record.track.id).or_insert_with(|| {
                candidates.push(Candidate {
                    id: record.track.id.clone(),
                    title: record.track.display_title().to_owned(),
                    duration_secs: record.track.duration_secs,
                    loudness: record.track.loudness,
                    players: BTreeSet::new(),
                    timestamps: BTreeSet::new(),
                    num_plays: 0,
                });
                candidates.len() - 1
            });

            let candidate = &mut candidates[position];
            candidate.players.insert(record.participant.clone());
            candidate.timestamps.insert(record.timestamp);
            candidate.num_plays += 1;

            // Later records may carry metadata that was missing earlier.
            if candidate.duration_secs.is_none() {
                candidate.duration_secs = record.track.duration_secs;
            }
            if candidate.loudness.is_none() {
                candidate.loudness = record.track.loudness;
            }
        }

        candidates.sort_by(|a, b| b.num_plays.cmp(&a.num_plays));
        candidates
    }

    #[must_use]
    pub fn played_by_count(&self) -> usize {
        self.players.len()
    }

    /// Whether anyone in `present` has ever played this track.
    #[must_use]
    pub fn played_by_any(&self, present: &[ParticipantId]) -> bool {
        present.iter().any(|participant| self.players.contains(participant))
    }
}
