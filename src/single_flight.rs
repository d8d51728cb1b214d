//! Coalescing of concurrent identical requests.
//!
//! A [`SingleFlight`] runs at most one computation per key at a time. Callers
//! that ask for a key while its computation is in flight wait for that same
//! computation instead of starting another, and every caller receives the
//! same outcome, success or error.
//!
//! The in-flight record for a key is removed *before* anybody is notified,
//! so a call made after settlement always starts afresh. Results are not
//! remembered; pair with a [`TtlCache`](crate::cache::TtlCache) for that
//! (see [`CachedLookup`](crate::lookup::CachedLookup)).
//!
//! Computations run as their own tasks. A caller that stops waiting does not
//! cancel the computation: it runs to completion for the benefit of the
//! other waiters and whatever side effects it has, such as filling a cache.

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    future::Future,
    hash::Hash,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
};

use futures_util::FutureExt;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Waiters<T> = Vec<oneshot::Sender<Result<T>>>;

/// Deduplicates concurrent computations sharing a key.
///
/// Clones share the same in-flight table.
pub struct SingleFlight<K, T> {
    in_flight: Arc<Mutex<HashMap<K, Waiters<T>>>>,
}

impl<K, T> Clone for SingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::default(),
        }
    }
}

impl<K, T> fmt::Debug for SingleFlight<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("SingleFlight")
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + 'static,
    T: Clone + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the outcome of `compute` for `key`, joining a computation that
    /// is already in flight for the same key if there is one.
    ///
    /// `compute` is only called when this caller starts the computation.
    ///
    /// # Errors
    ///
    /// Returns the error of the computation, or [`ErrorKind::Internal`] if it
    /// panicked.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    ///
    /// [`ErrorKind::Internal`]: crate::error::ErrorKind::Internal
    pub async fn enqueue<F, Fut>(&self, key: K, compute: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let leader = match self.lock().entry(key.clone()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };

        if leader {
            let future = compute();
            let in_flight = Arc::clone(&self.in_flight);
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::internal(format!("computation for {key:?} panicked")))
                    });

                let waiters = in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key)
                    .unwrap_or_default();

                trace!("settled {key:?} for {} waiter(s)", waiters.len());
                for waiter in waiters {
                    // A waiter that went away no longer cares.
                    let _ = waiter.send(outcome.clone());
                }
            });
        } else {
            trace!("joining computation in flight for {key:?}");
        }

        rx.await
            .unwrap_or_else(|_| Err(Error::internal("computation task vanished")))
    }

    /// Whether a computation for `key` is running right now.
    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of keys with a computation running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Waiters<T>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
