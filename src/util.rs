//! Time and naming helpers shared across modules.
//!
//! Cache entries and play records carry wall-clock timestamps in
//! milliseconds since the Unix epoch, because they outlive the process.
//! The [`Clock`] trait lets tests move that wall clock by hand.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{self, Duration},
};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: fmt::Debug + Send + Sync {
    /// The current time in epoch milliseconds.
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        now_from_epoch()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can hand one clone to a cache and
/// keep another to advance it.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn starting_at(millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(as_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Get the current system time in epoch milliseconds.
///
/// A system clock set before the epoch reads as zero.
#[must_use]
pub fn now_from_epoch() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map_or(0, as_millis)
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Converts a gain in decibels to a linear amplitude ratio.
#[must_use]
pub fn db_to_ratio(db: f32) -> f32 {
    f32::powf(10.0, db / 20.0)
}

/// Makes a cache name safe to use as a file name.
///
/// Path separators and anything outside a conservative character set are
/// replaced by underscores, so `guild/123-plays` becomes `guild_123-plays`.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|chr| {
            if chr.is_ascii_alphanumeric() || matches!(chr, '-' | '_' | '.') {
                chr
            } else {
                '_'
            }
        })
        .collect();

    // Never produce a hidden file or a parent directory reference.
    sanitized.trim_start_matches('.').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_separators() {
        assert_eq!(sanitize_name("guild/123-plays"), "guild_123-plays");
        assert_eq!(sanitize_name("../etc"), "_etc");
        assert_eq!(sanitize_name("a b:c"), "a_b_c");
    }

    #[test]
    fn converts_decibels() {
        assert!((db_to_ratio(0.0) - 1.0).abs() < f32::EPSILON);
        assert!((db_to_ratio(-20.0) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::starting_at(1_000);
        let other = clock.clone();
        clock.advance(Duration::from_secs(2));
        assert_eq!(other.now_millis(), 3_000);
    }
}
