//! A cache in front of a slow lookup.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;

use crate::{cache::TtlCache, error::Result, single_flight::SingleFlight};

/// Answers from a [`TtlCache`] when it can, and otherwise runs the lookup
/// once no matter how many callers ask for the same key at the same time.
///
/// Successful results are written to the cache. Errors are not, so the next
/// caller tries again. Neither are results of lookups that were already
/// running when the cache was invalidated.
pub struct CachedLookup<V> {
    cache: TtlCache<V>,
    flights: SingleFlight<String, V>,

    /// Bumped by every invalidation.
    epoch: Arc<AtomicU64>,
}

impl<V> Clone for CachedLookup<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            flights: self.flights.clone(),
            epoch: Arc::clone(&self.epoch),
        }
    }
}

impl<V> fmt::Debug for CachedLookup<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedLookup")
            .field("cache", &self.cache)
            .field("flights", &self.flights)
            .finish()
    }
}

impl<V> CachedLookup<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(cache: TtlCache<V>) -> Self {
        Self {
            cache,
            flights: SingleFlight::new(),
            epoch: Arc::default(),
        }
    }

    /// Returns the cached value for `key`, or looks it up with `fetch`.
    ///
    /// # Errors
    ///
    /// Returns whatever error `fetch` returned, shared with every caller
    /// that joined the same lookup.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(value) = self.cache.get(key) {
            return Ok(value);
        }

        let cache = self.cache.clone();
        let epoch = Arc::clone(&self.epoch);
        let started_in = epoch.load(Ordering::SeqCst);
        let key = key.to_owned();
        self.flights
            .enqueue(key.clone(), move || {
                let lookup = fetch();
                async move {
                    let started = Instant::now();
                    let value = lookup.await?;
                    debug!(
                        "looked up \"{key}\" for cache \"{}\" in {} ms",
                        cache.name(),
                        started.elapsed().as_millis()
                    );

                    if epoch.load(Ordering::SeqCst) == started_in {
                        cache.set(key, value.clone());
                    } else {
                        trace!("not caching \"{key}\": invalidated while looking it up");
                    }
                    Ok(value)
                }
            })
            .await
    }

    /// Drops the cached value for `key` so the next call looks it up again.
    pub fn invalidate(&self, key: &str) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.remove(key)
    }

    #[must_use]
    pub fn cache(&self) -> &TtlCache<V> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;
    use crate::error::Error;

    async fn lookup(calls: Arc<AtomicUsize>, value: Result<String>) -> Result<String> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        value
    }

    #[tokio::test(start_paused = true)]
    async fn caches_successes() {
        let lookups = CachedLookup::new(TtlCache::in_memory("titles", Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            lookups.get_or_fetch("x", || lookup(Arc::clone(&calls), Ok("title".to_owned()))),
            lookups.get_or_fetch("x", || lookup(Arc::clone(&calls), Ok("other".to_owned()))),
        );
        assert_eq!(a.unwrap(), "title");
        assert_eq!(b.unwrap(), "title");

        let c = lookups
            .get_or_fetch("x", || lookup(Arc::clone(&calls), Ok("other".to_owned())))
            .await;
        assert_eq!(c.unwrap(), "title");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(lookups.invalidate("x"));
        let d = lookups
            .get_or_fetch("x", || lookup(Arc::clone(&calls), Ok("other".to_owned())))
            .await;
        assert_eq!(d.unwrap(), "other");
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_cache_errors() {
        let lookups = CachedLookup::new(TtlCache::in_memory("titles", Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        lookups
            .get_or_fetch("x", || lookup(Arc::clone(&calls), Err(Error::unavailable("down"))))
            .await
            .unwrap_err();
        assert!(lookups.cache().get("x").is_none());

        let value = lookups
            .get_or_fetch("x", || lookup(Arc::clone(&calls), Ok("title".to_owned())))
            .await
            .unwrap();
        assert_eq!(value, "title");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_lookup_is_not_undone() {
        let lookups = CachedLookup::new(TtlCache::in_memory("titles", Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let running = {
            let lookups = lookups.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                lookups
                    .get_or_fetch("x", || lookup(calls, Ok("stale".to_owned())))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!lookups.invalidate("x"));

        assert_eq!(running.await.unwrap().unwrap(), "stale");
        assert!(lookups.cache().get("x").is_none());
    }
}
