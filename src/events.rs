//! Events emitted by a listening session.
//!
//! Events announce *that* something changed; the new values are read from
//! the [`PlayerState`](crate::state::PlayerState). They can be used to:
//! * Refresh a "now playing" display
//! * Log track changes
//! * Tell listeners that the room ran out of music
//!
//! # Example
//!
//! ```rust
//! use jukebox::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::TrackChanged => println!("New track playing"),
//!         Event::NothingToPlay => println!("Queue and shuffle came up empty"),
//!         // ... handle other events ...
//!         _ => {}
//!     }
//! }
//! ```

/// Events that can be emitted by a session.
///
/// # Events
///
/// Events fall into two categories:
///
/// Playback Events:
/// * [`Play`](Self::Play) - Playback starts or resumes
/// * [`Pause`](Self::Pause) - Playback pauses or goes idle
/// * [`TrackChanged`](Self::TrackChanged) - Current track changes
/// * [`NothingToPlay`](Self::NothingToPlay) - Advancing found no track
///
/// Queue Events:
/// * [`QueueChanged`](Self::QueueChanged) - Explicit queue changes
/// * [`ShuffleChanged`](Self::ShuffleChanged) - Shuffle is toggled
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Playback has started.
    ///
    /// Emitted when the output starts a new track or resumes a paused one.
    Play,

    /// Playback has stopped, for now.
    ///
    /// Emitted on pause, on auto-pause and when a track ends.
    Pause,

    /// Current track has changed.
    ///
    /// Emitted when advancing picks a different track, whether it was
    /// requested, shuffled, or nothing at all.
    TrackChanged,

    /// The explicit queue has changed.
    QueueChanged,

    /// Shuffle was enabled or disabled.
    ShuffleChanged,

    /// Advancing found neither a queued request nor a recommendation.
    NothingToPlay,
}
