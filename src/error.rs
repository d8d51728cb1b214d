//! Error handling for jukebox.
//!
//! All fallible operations return [`Result`], whose error carries an
//! [`ErrorKind`] modelled on gRPC status codes plus the underlying cause.
//!
//! # Error Categories
//!
//! The scheduling core distinguishes three families of failures:
//! * Missing things: no candidate to play, no metadata for an id
//!   ([`ErrorKind::NotFound`])
//! * Transient I/O: disk or network hiccups that a later attempt may not hit
//!   ([`ErrorKind::Unavailable`], [`ErrorKind::DeadlineExceeded`],
//!   [`ErrorKind::DataLoss`], [`ErrorKind::Aborted`])
//! * Invariant violations: wiring mistakes that should never happen in a
//!   correct program ([`ErrorKind::Internal`], [`ErrorKind::FailedPrecondition`])
//!
//! # Sharing
//!
//! Unlike most error types, [`struct@Error`] is [`Clone`]. A single-flight
//! computation settles exactly once and every waiter receives the same
//! outcome, so the cause is reference counted instead of boxed.
//!
//! # Example
//!
//! ```rust
//! use jukebox::error::{Error, ErrorKind, Result};
//!
//! fn lookup(id: &str) -> Result<()> {
//!     if id.is_empty() {
//!         return Err(Error::invalid_argument("track id is empty"));
//!     }
//!
//!     let _contents = std::fs::read("cache/plays.cache")?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::{fmt, sync::Arc};
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Clone, Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Arc<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for jukebox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// Only the codes that the scheduling core can actually produce are
/// represented. The discriminants match the gRPC numbering.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// The caller stopped waiting for the operation.
    #[error("operation was cancelled")]
    Cancelled = 1,

    /// An error that fits no other category.
    #[error("unknown error")]
    Unknown = 2,

    /// The caller passed something unusable.
    #[error("invalid argument specified")]
    InvalidArgument = 3,

    /// An external collaborator did not answer in time.
    #[error("operation timed out")]
    DeadlineExceeded = 4,

    /// Nothing to play, or nothing known about a track.
    #[error("not found")]
    NotFound = 5,

    /// The operation is not allowed in the current state.
    #[error("invalid state")]
    FailedPrecondition = 9,

    /// The operation was interrupted mid-way.
    #[error("operation aborted")]
    Aborted = 10,

    /// The collaborator does not support the operation.
    #[error("not implemented")]
    Unimplemented = 12,

    /// A broken invariant inside jukebox itself.
    #[error("internal error")]
    Internal = 13,

    /// A collaborator or the disk is temporarily unavailable.
    #[error("service unavailable")]
    Unavailable = 14,

    /// Persisted data could not be read back.
    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: Arc::from(error.into()),
        }
    }

    /// Creates an error for operations that were interrupted mid-execution.
    pub fn aborted<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Aborted, error)
    }

    /// Creates an error for operations whose caller gave up waiting.
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    /// Creates an error for persisted data that cannot be decoded.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::data_loss("cache file truncated");
    /// assert_eq!(err.kind, ErrorKind::DataLoss);
    /// ```
    pub fn data_loss<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DataLoss, error)
    }

    /// Creates an error for lookups that exceeded their deadline.
    pub fn deadline_exceeded<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeadlineExceeded, error)
    }

    /// Creates an error for operations that cannot proceed in the current
    /// state, such as logging a play without a track.
    pub fn failed_precondition<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FailedPrecondition, error)
    }

    /// Creates an error for broken internal invariants.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::internal("single-flight computation panicked");
    /// assert_eq!(err.kind, ErrorKind::Internal);
    /// ```
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }

    /// Creates an error for unusable arguments.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for missing tracks, metadata or candidates.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::not_found("no metadata for track dQw4w9WgXcQ");
    /// assert_eq!(err.kind, ErrorKind::NotFound);
    /// ```
    pub fn not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotFound, error)
    }

    /// Creates an error for unsupported collaborator operations.
    pub fn unimplemented<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unimplemented, error)
    }

    /// Creates an error for collaborators that are temporarily down.
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    /// Creates an error that doesn't fit any other category.
    pub fn unknown<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unknown, error)
    }

    /// Whether a later attempt of the same operation might succeed.
    ///
    /// Transient errors are the ones caches treat as a miss and callers may
    /// retry: unavailability, timeouts, interrupted and corrupted I/O.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Unavailable
                | ErrorKind::DeadlineExceeded
                | ErrorKind::DataLoss
                | ErrorKind::Aborted
        )
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as "{kind}: {details}".
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into their logical equivalents.
///
/// Most filesystem failures are transient from the cache's point of view;
/// a missing file is `NotFound` so a cold start can be told apart.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied | ConnectionRefused | NotConnected | AddrNotAvailable => {
                Self::unavailable(err)
            }
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof | InvalidData => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput => Self::invalid_argument(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts JSON errors: syntax and data errors in persisted tables are
/// corruption, I/O errors are mapped through the IO rules.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            std::io::Error::from(err).into()
        } else {
            Self::data_loss(err)
        }
    }
}

/// Converts configuration parse errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

/// Converts task join errors: cancellation stays cancellation, a panic is
/// an internal error.
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::cancelled(e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

/// Converts mutex poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}
