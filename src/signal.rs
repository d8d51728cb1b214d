//! Process signals that stop the jukebox or reload its roster.
//!
//! * Unix: Ctrl-C (SIGINT) and SIGTERM stop, SIGHUP reloads
//! * Windows: Ctrl-C only
//!
//! # Example
//!
//! ```no_run
//! use jukebox::signal::{Handler, ShutdownSignal};
//!
//! async fn example() {
//!     let mut signals = Handler::new().unwrap();
//!
//!     match signals.recv().await {
//!         ShutdownSignal::Interrupt | ShutdownSignal::Terminate => {
//!             println!("Shutting down...");
//!         }
//!         ShutdownSignal::Reload => {
//!             println!("Reloading participants...");
//!         }
//!     }
//! }
//! ```

use std::fmt;

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signal received by the process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[expect(clippy::module_name_repetitions)]
pub enum ShutdownSignal {
    /// Ctrl-C (SIGINT)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP: re-read the configuration, keep playing.
    Reload,
}

impl ShutdownSignal {
    /// Whether the process should exit.
    #[must_use]
    pub fn is_shutdown(self) -> bool {
        !matches!(self, Self::Reload)
    }
}

/// Listens for process signals.
///
/// Handlers are registered on creation, so signals that arrive before the
/// first [`recv`](Self::recv) are not lost.
pub struct Handler {
    #[cfg(unix)]
    sigterm: Signal,
    #[cfg(unix)]
    sighup: Signal,
}

impl Handler {
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
                _ = self.sigterm.recv() => ShutdownSignal::Terminate,
                _ = self.sighup.recv() => ShutdownSignal::Reload,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            ShutdownSignal::Interrupt
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "Ctrl+C"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Reload => write!(f, "SIGHUP"),
        }
    }
}
