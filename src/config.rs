//! Configuration loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working setup. Durations are written in milliseconds or seconds as the
//! field names say.
//!
//! ```toml
//! [cache]
//! directory = "./cache"
//! flush_debounce_ms = 1000
//!
//! [shuffle]
//! min_duration_secs = 60
//! ideal_duration_secs = 270
//! max_duration_secs = 900
//! history_window_secs = 43200
//! ```

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache: CacheConfig,
    pub shuffle: ShuffleConfig,
    pub playback: PlaybackConfig,
    pub library: LibraryConfig,
}

/// Settings for every [`TtlCache`](crate::cache::TtlCache).
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Whether caches restore from and flush to disk, and answer hits at all.
    pub enabled: bool,

    /// Directory holding one `<name>.cache` file per cache.
    pub directory: PathBuf,

    /// Quiet period after the last write before the table is flushed.
    pub flush_debounce_ms: u64,

    /// Time to live for caches that do not set their own.
    pub default_ttl_secs: u64,

    /// Time to live of a room's aggregated play population.
    pub plays_ttl_secs: u64,

    /// Time to live of display metadata.
    pub metadata_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./cache"),
            flush_debounce_ms: 1_000,
            default_ttl_secs: 24 * 60 * 60,
            plays_ttl_secs: 10 * 60,
            metadata_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn plays_ttl(&self) -> Duration {
        Duration::from_secs(self.plays_ttl_secs)
    }

    #[must_use]
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }
}

/// Tuning of the recommendation selector.
///
/// The weights are policy, not contract: only the way they are combined is
/// fixed.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ShuffleConfig {
    /// Tracks this short or shorter are never picked.
    pub min_duration_secs: f64,

    /// Duration that earns the full duration-shape weight.
    pub ideal_duration_secs: f64,

    /// Tracks this long or longer are never picked.
    pub max_duration_secs: f64,

    /// Weight per distinct participant who played a track.
    pub participants_weight: f64,

    /// Weight per distinct month with at least one play.
    pub months_weight: f64,

    /// Weight of a track at exactly the ideal duration.
    pub duration_weight: f64,

    /// How long a played track stays excluded.
    pub history_window_secs: u64,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: 60.0,
            ideal_duration_secs: 270.0,
            max_duration_secs: 900.0,
            participants_weight: 4.0,
            months_weight: 4.0,
            duration_weight: 10.0,
            history_window_secs: 12 * 60 * 60,
        }
    }
}

impl ShuffleConfig {
    #[must_use]
    pub fn history_window(&self) -> Duration {
        Duration::from_secs(self.history_window_secs)
    }

    /// Checks that the duration bounds describe a proper triangle.
    pub fn validate(&self) -> Result<()> {
        let Self {
            min_duration_secs: min,
            ideal_duration_secs: ideal,
            max_duration_secs: max,
            ..
        } = *self;
        if !(min < ideal && ideal < max) {
            return Err(Error::invalid_argument(format!(
                "shuffle durations must satisfy min < ideal < max (got {min}, {ideal}, {max})"
            )));
        }

        for (name, weight) in [
            ("participants_weight", self.participants_weight),
            ("months_weight", self.months_weight),
            ("duration_weight", self.duration_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::invalid_argument(format!(
                    "{name} must be a non-negative number (got {weight})"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PlaybackConfig {
    /// How long the output must stay idle before advancing.
    pub idle_debounce_ms: u64,

    /// Loudness every track is normalized towards.
    pub target_lufs: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            idle_debounce_ms: 1_000,
            target_lufs: -14.0,
        }
    }
}

impl PlaybackConfig {
    #[must_use]
    pub fn idle_debounce(&self) -> Duration {
        Duration::from_millis(self.idle_debounce_ms)
    }
}

/// Paths used by the file-backed collaborators of the binary.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LibraryConfig {
    /// JSON file with tracks and play records.
    pub plays_file: PathBuf,

    /// Directory with one audio file per track id.
    pub media_directory: PathBuf,

    /// Participants considered present in every room.
    pub participants: Vec<String>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            plays_file: PathBuf::from("plays.json"),
            media_directory: PathBuf::from("./download"),
            participants: Vec::new(),
        }
    }
}

impl Config {
    /// Prevent out-of-memory conditions: configuration files are small.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is too large, does not
    /// parse, or holds inconsistent shuffle settings.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::invalid_argument(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.shuffle.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config: Config = "[shuffle]\nmonths_weight = 2.0\n\n[playback]\nidle_debounce_ms = 250\n"
            .parse()
            .unwrap();
        assert!((config.shuffle.months_weight - 2.0).abs() < f64::EPSILON);
        assert!((config.shuffle.duration_weight - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.playback.idle_debounce(), Duration::from_millis(250));
        assert!(config.cache.enabled);
    }

    #[test]
    fn rejects_inverted_durations() {
        let err = "[shuffle]\nmin_duration_secs = 500.0\n"
            .parse::<Config>()
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!("[cache]\nttl = 3\n".parse::<Config>().is_err());
    }
}
