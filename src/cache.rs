//! Time-to-live cache with debounced persistence.
//!
//! A [`TtlCache`] is an in-memory table of string keys to values, each
//! stamped with the wall-clock time it was written. Reads treat entries older
//! than the time to live as misses, but never purge them: expiry is lazy and
//! an expired entry lingers until it is overwritten or removed.
//!
//! # Persistence
//!
//! Every write schedules a flush of the *whole* table to a [`CacheStore`].
//! Flushes are debounced on the trailing edge: a burst of writes results in
//! a single flush, one debounce window after the last write of the burst.
//! A failed flush is logged and not retried; the next write schedules a new
//! one.
//!
//! On construction the table is restored from the store in the background.
//! Until that completes the cache is cold, and callers must cope with
//! misses. Restore failures are logged and leave the cache empty.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use jukebox::cache::{CacheSettings, TtlCache};
//!
//! # async fn example() {
//! let cache = TtlCache::<String>::open(
//!     "titles",
//!     CacheSettings::default().ttl(Duration::from_secs(3600)),
//! );
//! cache.set("dQw4w9WgXcQ", "Never Gonna Give You Up".to_owned());
//! assert!(cache.get("dQw4w9WgXcQ").is_some());
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    config::CacheConfig,
    error::{ErrorKind, Result},
    util::{as_millis, sanitize_name, Clock, SystemClock},
};

/// Durable storage for one cache's table.
///
/// Stores read and write the whole table at once.
#[async_trait]
pub trait CacheStore: fmt::Debug + Send + Sync {
    /// Returns `Ok(None)` when nothing was stored yet.
    async fn read_all(&self) -> Result<Option<Vec<u8>>>;

    async fn write_all(&self, contents: Vec<u8>) -> Result<()>;
}

/// Stores a table as `<directory>/<sanitized name>.cache`.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(directory: impl AsRef<Path>, name: &str) -> Self {
        let path = directory
            .as_ref()
            .join(format!("{}.cache", sanitize_name(name)));
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn read_all(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, contents: Vec<u8>) -> Result<()> {
        if let Some(directory) = self.path.parent() {
            tokio::fs::create_dir_all(directory).await?;
        }

        // Write aside and rename so a crash mid-write never leaves a
        // truncated table behind.
        let partial = self.path.with_extension("cache.partial");
        tokio::fs::write(&partial, contents).await?;
        tokio::fs::rename(&partial, &self.path).await?;
        Ok(())
    }
}

/// Keeps a table in memory. Counts writes, which makes it handy in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: Mutex<Option<Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_contents(contents: Vec<u8>) -> Self {
        Self {
            contents: Mutex::new(Some(contents)),
            writes: AtomicUsize::new(0),
        }
    }

    /// How many times the table was written.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn read_all(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    async fn write_all(&self, contents: Vec<u8>) -> Result<()> {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How a [`TtlCache`] behaves. Built fluently from the defaults.
#[derive(Clone, Debug)]
pub struct CacheSettings {
    ttl: Duration,
    debounce: Duration,
    enabled: bool,
    store: Option<Arc<dyn CacheStore>>,
    clock: Arc<dyn Clock>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            debounce: Duration::from_secs(1),
            enabled: true,
            store: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl CacheSettings {
    /// Settings for a persistent cache as described by the configuration.
    #[must_use]
    pub fn from_config(config: &CacheConfig, name: &str) -> Self {
        Self::default()
            .ttl(config.default_ttl())
            .debounce(config.flush_debounce())
            .enabled(config.enabled)
            .store(Arc::new(FileStore::new(&config.directory, name)))
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// A disabled cache never restores, never flushes and never hits.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Without a store the cache lives in memory only.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Opens named caches that share a configuration and a clock.
///
/// Persistent caches each get their own file in the configured directory;
/// in-memory caches are never written anywhere.
#[derive(Clone, Debug)]
pub struct Caches {
    config: Option<CacheConfig>,
    clock: Arc<dyn Clock>,
}

impl Caches {
    #[must_use]
    pub fn persistent(config: CacheConfig) -> Self {
        Self {
            config: Some(config),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            config: None,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Opens the cache called `name` with time to live `ttl`.
    #[must_use]
    pub fn open<V>(&self, name: &str, ttl: Duration) -> TtlCache<V>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let settings = match &self.config {
            Some(config) => CacheSettings::from_config(config, name),
            None => CacheSettings::default(),
        };
        TtlCache::open(name, settings.ttl(ttl).clock(Arc::clone(&self.clock)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry<V> {
    data: V,

    /// Epoch milliseconds of the last write.
    ts: u64,

    /// Overrides the cache-wide time to live for this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<u64>,
}

type Table<V> = Arc<Mutex<HashMap<String, Entry<V>>>>;

struct Inner<V> {
    name: String,
    entries: Table<V>,

    /// Cache-wide time to live in milliseconds.
    ttl: AtomicU64,

    enabled: bool,
    clock: Arc<dyn Clock>,
    flush_tx: Option<mpsc::UnboundedSender<()>>,
    store: Option<Arc<dyn CacheStore>>,
    restored: watch::Receiver<bool>,
}

/// A cache of values that expire a fixed time after they were written.
///
/// Clones share the same table.
pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.inner.name)
            .field("enabled", &self.inner.enabled)
            .finish_non_exhaustive()
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens a cache, restoring its table in the background.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime and the cache has a
    /// store, because restoring and flushing run as background tasks.
    #[must_use]
    pub fn open(name: impl Into<String>, settings: CacheSettings) -> Self {
        let name = name.into();
        let entries: Table<V> = Arc::default();

        let store = settings.store.filter(|_| settings.enabled);
        if !settings.enabled {
            debug!("cache \"{name}\" disabled");
        }

        let (restored_tx, restored) = watch::channel(store.is_none());
        let flush_tx = store.as_ref().map(|store| {
            tokio::spawn(restore(
                name.clone(),
                Arc::clone(&entries),
                Arc::clone(store),
                restored_tx,
            ));

            let (flush_tx, flush_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_flusher(
                name.clone(),
                Arc::clone(&entries),
                Arc::clone(store),
                settings.debounce,
                restored.clone(),
                flush_rx,
            ));
            flush_tx
        });

        Self {
            inner: Arc::new(Inner {
                name,
                entries,
                ttl: AtomicU64::new(as_millis(settings.ttl)),
                enabled: settings.enabled,
                clock: settings.clock,
                flush_tx,
                store,
                restored,
            }),
        }
    }

    /// A cache that is never persisted.
    #[must_use]
    pub fn in_memory(name: impl Into<String>, ttl: Duration) -> Self {
        Self::open(name, CacheSettings::default().ttl(ttl))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the value for `key` unless it is absent or expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.lock();
        entries
            .get(key)
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.data.clone())
    }

    /// Whether `key` holds an entry that has not expired.
    #[must_use]
    pub fn is_valid(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(|entry| self.is_fresh(entry))
    }

    /// Writes `value`, refreshing its timestamp, and schedules a flush.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.insert(key.into(), value, None);
    }

    /// Like [`set`](Self::set), with a time to live for this entry only.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.insert(key.into(), value, Some(as_millis(ttl)));
    }

    /// Drops the entry for `key`, returning whether there was one.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.lock().remove(key).is_some();
        if removed {
            self.schedule_flush();
        }
        removed
    }

    /// Changes the cache-wide time to live. Applies to existing entries too.
    pub fn set_ttl(&self, ttl: Duration) {
        self.inner.ttl.store(as_millis(ttl), Ordering::Relaxed);
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.inner.ttl.load(Ordering::Relaxed))
    }

    /// Number of entries held, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until the background restore has finished, successfully or not.
    pub async fn restored(&self) {
        let mut restored = self.inner.restored.clone();
        // An error means the restore task is gone, which also means done.
        let _ = restored.wait_for(|done| *done).await;
    }

    /// Writes the table to the store right away, bypassing the debounce.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be serialized or written.
    pub async fn flush(&self) -> Result<()> {
        match &self.inner.store {
            Some(store) => write_table(&self.inner.name, &self.inner.entries, store.as_ref()).await,
            None => Ok(()),
        }
    }

    fn insert(&self, key: String, data: V, ttl: Option<u64>) {
        let ts = self.inner.clock.now_millis();
        self.lock().insert(key, Entry { data, ts, ttl });
        self.schedule_flush();
    }

    fn is_fresh(&self, entry: &Entry<V>) -> bool {
        if !self.inner.enabled {
            return false;
        }

        let ttl = entry
            .ttl
            .unwrap_or_else(|| self.inner.ttl.load(Ordering::Relaxed));
        let age = self.inner.clock.now_millis().saturating_sub(entry.ts);
        age <= ttl
    }

    fn schedule_flush(&self) {
        if let Some(tx) = &self.inner.flush_tx {
            // The flusher only stops when this sender is dropped.
            let _ = tx.send(());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry<V>>> {
        // Entries are replaced whole, so a panic elsewhere cannot have left
        // one half-written.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn write_table<V>(name: &str, entries: &Table<V>, store: &dyn CacheStore) -> Result<()>
where
    V: Serialize,
{
    let contents = {
        let entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_vec(&*entries)?
    };

    trace!("writing cache \"{name}\" ({} bytes)", contents.len());
    store.write_all(contents).await
}

async fn restore<V>(
    name: String,
    entries: Table<V>,
    store: Arc<dyn CacheStore>,
    restored: watch::Sender<bool>,
) where
    V: DeserializeOwned,
{
    let result = match store.read_all().await {
        Ok(Some(contents)) => serde_json::from_slice::<HashMap<String, Entry<V>>>(&contents)
            .map(Some)
            .map_err(Into::into),
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    };

    match result {
        Ok(Some(persisted)) => {
            let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
            let count = persisted.len();
            for (key, entry) in persisted {
                // Writes that raced the restore are newer than the disk.
                match entries.get(&key) {
                    Some(current) if current.ts >= entry.ts => {}
                    _ => {
                        entries.insert(key, entry);
                    }
                }
            }
            debug!("restored {count} entries into cache \"{name}\"");
        }
        Ok(None) => trace!("no persisted table for cache \"{name}\""),
        Err(e) if e.kind == ErrorKind::NotFound => {
            trace!("no persisted table for cache \"{name}\"");
        }
        Err(e) => error!("failed to restore cache \"{name}\", starting empty: {e}"),
    }

    restored.send_replace(true);
}

/// Flushes the table one debounce window after the last write signal.
///
/// Exits when the cache is dropped, flushing first if a write is pending.
async fn run_flusher<V>(
    name: String,
    entries: Table<V>,
    store: Arc<dyn CacheStore>,
    debounce: Duration,
    mut restored: watch::Receiver<bool>,
    mut rx: mpsc::UnboundedReceiver<()>,
) where
    V: Serialize,
{
    while rx.recv().await.is_some() {
        let deadline = tokio::time::sleep(debounce);
        tokio::pin!(deadline);

        let mut closed = false;
        loop {
            tokio::select! {
                biased;

                signal = rx.recv() => match signal {
                    Some(()) => deadline.as_mut().reset(Instant::now() + debounce),
                    None => {
                        closed = true;
                        break;
                    }
                },

                () = &mut deadline => break,
            }
        }

        // Never overwrite the persisted table before it has been read.
        let _ = restored.wait_for(|done| *done).await;

        if let Err(e) = write_table(&name, &entries, store.as_ref()).await {
            error!("failed to write cache \"{name}\": {e}");
        }

        if closed {
            break;
        }
    }

    trace!("flusher of cache \"{name}\" stopped");
}
