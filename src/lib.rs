//! Scheduler for shared listening rooms.
//!
//! Every room gets a [`Session`](session::Session) that plays explicitly
//! requested tracks first and otherwise shuffles through the room's play
//! history. The shuffle favors tracks that more of the people present have
//! played, over more months, with a length close to a typical song. Tracks
//! played recently are held back for a while.
//!
//! External systems (media platform, metadata catalog, chat roster, play
//! database, audio output) are reached through the traits in [`provider`].
//! The [`local`] module implements them on top of files and memory.
//!
//! # Lookups
//!
//! Slow lookups are memoized in [`cache::TtlCache`]s that survive restarts,
//! and concurrent lookups of the same key are merged by
//! [`single_flight::SingleFlight`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod local;
pub mod lookup;
pub mod media;
pub mod metadata;
pub mod playback;
pub mod provider;
pub mod queue;
pub mod rand;
pub mod session;
pub mod shuffle;
pub mod signal;
pub mod single_flight;
pub mod state;
pub mod track;
pub mod util;
