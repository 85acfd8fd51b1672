//! The flat cache facade.
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!                 │                  Cache<V>                    │
//!                 │                                              │
//!   get/set ────► │  key ──FxHasher──► bucket[hash & mask]       │
//!                 │        (RwLock<FxHashMap<key, Arc<Entry>>>)  │
//!                 │             │                                │
//!                 │             ├─► promotables ──┐              │
//!                 │             └─► deletables  ──┤              │
//!   clear/gc ───► │                 control     ──┼─► worker     │
//!                 │                                │  (list, size,│
//!                 │                                │   eviction)  │
//!                 └────────────────────────────────┴─────────────┘
//! ```
//!
//! Reads touch exactly one shard under its shared lock and at most
//! try-send one promotion hint; they never block on the worker. Writes
//! touch one shard under its exclusive lock and may block briefly on the
//! deletions channel when the worker is saturated. Recency is therefore
//! eventually consistent: a `get` does not imply the entry is at the list
//! head by the time it returns. [`Cache::sync_updates`] is the barrier
//! when ordering matters.
//!
//! ## Example Usage
//!
//! ```
//! use std::time::Duration;
//! use shardlru::cache::Cache;
//! use shardlru::config::Configuration;
//!
//! let cache = Cache::with_config(Configuration::new().max_size(100)).unwrap();
//!
//! cache.set("user:1", "alice".to_string(), Duration::from_secs(60));
//! let entry = cache.get("user:1").unwrap();
//! assert_eq!(entry.value(), "alice");
//! assert!(!entry.expired());
//!
//! cache.delete("user:1");
//! cache.sync_updates();
//! assert!(cache.get("user:1").is_none());
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bucket::{key_hash, Bucket};
use crate::config::Configuration;
use crate::entry::{Entry, TrackedEntry};
use crate::error::ConfigError;
use crate::weight::Weigher;
use crate::worker::{self, Channels, EntryIndex, Event};

/// Shard table for single-level keys.
pub(crate) struct FlatIndex<V> {
    buckets: Box<[Bucket<V>]>,
    mask: u32,
}

impl<V> FlatIndex<V> {
    pub(crate) fn new(bucket_count: u32) -> Self {
        Self {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
            mask: bucket_count - 1,
        }
    }

    pub(crate) fn bucket(&self, key: &str) -> &Bucket<V> {
        &self.buckets[(key_hash(key) & self.mask) as usize]
    }

    pub(crate) fn buckets(&self) -> &[Bucket<V>] {
        &self.buckets
    }
}

impl<V> EntryIndex<V> for FlatIndex<V>
where
    V: Send + Sync + 'static,
{
    fn evict(&self, entry: &Entry<V>) {
        let _ = self.bucket(entry.key()).delete(entry.key());
    }

    fn clear_all<F: FnOnce()>(&self, drain: F) {
        let mut guards: Vec<_> = self.buckets.iter().map(|b| b.write_guard()).collect();
        for guard in guards.iter_mut() {
            guard.clear();
        }
        drain();
    }
}

/// A concurrent LRU cache over string keys.
///
/// Cheap reads are the design goal: `get` takes one shard's shared lock
/// and hands recency bookkeeping to a background worker. Entries are
/// returned as `Arc<Entry<V>>` and stay readable after deletion or
/// eviction.
///
/// All methods take `&self`; wrap the cache in an `Arc` to share it across
/// threads. Dropping the cache (or calling [`Cache::stop`]) shuts the
/// worker down; afterwards the control operations return their zero
/// defaults and mutations stop feeding the recency list.
pub struct Cache<V: Send + Sync + 'static> {
    index: Arc<FlatIndex<V>>,
    channels: Channels<V>,
    weigher: Option<Weigher<V>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Send + Sync + 'static> Cache<V> {
    /// Creates a cache with the default [`Configuration`].
    pub fn new() -> Self {
        Self::with_config(Configuration::new()).expect("default configuration is valid")
    }

    /// Creates a cache from `config`, spawning its worker thread.
    pub fn with_config(config: Configuration<V>) -> Result<Self, ConfigError> {
        config.validate()?;
        let index = Arc::new(FlatIndex::new(config.buckets));
        let (channels, handle) = worker::spawn(Arc::clone(&index), &config);
        Ok(Self {
            index,
            channels,
            weigher: config.weigher,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Gets an entry, or `None` if the key is absent.
    ///
    /// This can return an expired entry: check [`Entry::expired`] /
    /// [`Entry::ttl`] if staleness matters. A hit on a live entry sends a
    /// recency hint to the worker; the hint is dropped if the promotion
    /// channel is full.
    pub fn get(&self, key: &str) -> Option<Arc<Entry<V>>> {
        let entry = self.index.bucket(key).get(key)?;
        if !entry.expired() {
            let _ = self.channels.promotables.try_send(Arc::clone(&entry));
        }
        Some(entry)
    }

    /// [`Cache::get`] without the recency hint.
    pub fn get_without_promote(&self, key: &str) -> Option<Arc<Entry<V>>> {
        self.index.bucket(key).get(key)
    }

    /// Stores `value` under `key` for `ttl`. An existing entry for the key
    /// is replaced wholesale and retired through the deletions channel.
    pub fn set(&self, key: &str, value: V, ttl: Duration) -> Arc<Entry<V>> {
        self.insert(key, value, ttl, false)
    }

    /// Swaps the value of an existing entry in place; returns `false` if
    /// the key is absent. Neither the TTL nor the entry's recency change.
    pub fn replace(&self, key: &str, value: V) -> bool {
        let size = self.weigh(&value);
        match self.index.bucket(key).replace(key, value, size) {
            Some(delta) => {
                if delta != 0 {
                    let _ = self.channels.deletables.send(Event::SizeChange(delta));
                }
                true
            }
            None => false,
        }
    }

    /// Pushes an existing entry's deadline to `ttl` from now; returns
    /// `false` if the key is absent.
    pub fn extend(&self, key: &str, ttl: Duration) -> bool {
        match self.index.bucket(key).get(key) {
            Some(entry) => {
                entry.extend(ttl);
                true
            }
            None => false,
        }
    }

    /// Returns the fresh entry for `key`, or produces, caches, and returns
    /// one. A producer error is propagated unchanged and nothing is
    /// cached.
    pub fn fetch<E>(
        &self,
        key: &str,
        ttl: Duration,
        produce: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<Entry<V>>, E> {
        if let Some(entry) = self.get(key) {
            if !entry.expired() {
                return Ok(entry);
            }
        }
        let value = produce()?;
        Ok(self.set(key, value, ttl))
    }

    /// Removes `key`; returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        match self.index.bucket(key).delete(key) {
            Some(entry) => {
                let _ = self.channels.deletables.send(Event::Delete(entry));
                true
            }
            None => false,
        }
    }

    /// Removes every key starting with `prefix`; returns how many were
    /// removed.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        self.retire_matching(|bucket| bucket.delete_prefix(prefix))
    }

    /// Removes every entry `matches` returns `true` for; returns how many
    /// were removed.
    pub fn delete_matching<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&str, &Arc<Entry<V>>) -> bool,
    {
        self.retire_matching(|bucket| bucket.delete_matching(&mut matches))
    }

    /// Visits every entry until `f` returns `false`. Entries are visited
    /// under their shard's shared lock; keep `f` short.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<Entry<V>>) -> bool,
    {
        for bucket in self.index.buckets() {
            if !bucket.for_each(&mut f) {
                return;
            }
        }
    }

    /// Number of keys across all shards (including expired, not yet
    /// evicted entries).
    pub fn item_count(&self) -> usize {
        self.index.buckets().iter().map(|b| b.len()).sum()
    }

    /// Gets and pins an entry. Meaningful only on a cache configured with
    /// [`Configuration::track`]; the pin keeps the entry out of GC's
    /// reach until the handle is dropped.
    pub fn tracking_get(&self, key: &str) -> Option<TrackedEntry<V>> {
        let entry = self.get(key)?;
        entry.track();
        Some(TrackedEntry::adopt(entry))
    }

    /// Stores and pins an entry in one step.
    pub fn tracking_set(&self, key: &str, value: V, ttl: Duration) -> TrackedEntry<V> {
        TrackedEntry::adopt(self.insert(key, value, ttl, true))
    }

    /// Drops every entry and resets accounting. Stalls all shards for the
    /// duration; queued updates are discarded without running `on_delete`.
    pub fn clear(&self) {
        self.channels.control.clear();
    }

    /// Forces an eviction pass (count or percent mode per configuration).
    pub fn gc(&self) {
        self.channels.control.gc();
    }

    /// Replaces the eviction threshold, evicting immediately if the cache
    /// is now overfull.
    pub fn set_max_size(&self, size: i64) {
        self.channels.control.set_max_size(size);
    }

    /// Total weight of all listed entries. Zero after [`Cache::stop`].
    pub fn get_size(&self) -> i64 {
        self.channels.control.get_size()
    }

    /// Number of entries evicted since the last call; resets the counter.
    pub fn get_dropped(&self) -> usize {
        self.channels.control.get_dropped()
    }

    /// Barrier: every update this thread enqueued before the call is
    /// reflected in the recency list and accounting on return. Makes no
    /// promise about concurrent submitters.
    pub fn sync_updates(&self) {
        self.channels.control.sync_updates();
    }

    /// Stops the worker and waits for it to drain pending deletions.
    /// Idempotent. Afterwards control operations return zero defaults and
    /// data operations no longer feed the recency list.
    pub fn stop(&self) {
        self.channels.control.stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn insert(&self, key: &str, value: V, ttl: Duration, track: bool) -> Arc<Entry<V>> {
        let size = self.weigh(&value);
        let (entry, existing) = self.index.bucket(key).set(key, value, ttl, size, track, None);
        if let Some(existing) = existing {
            let _ = self.channels.deletables.send(Event::Delete(existing));
        }
        let _ = self.channels.promotables.try_send(Arc::clone(&entry));
        entry
    }

    fn weigh(&self, value: &V) -> i64 {
        self.weigher.as_ref().map_or(1, |weigher| weigher(value))
    }

    fn retire_matching(&self, mut collect: impl FnMut(&Bucket<V>) -> Vec<Arc<Entry<V>>>) -> usize {
        let mut count = 0;
        for bucket in self.index.buckets() {
            let removed = collect(bucket);
            count += removed.len();
            for entry in removed {
                let _ = self.channels.deletables.send(Event::Delete(entry));
            }
        }
        count
    }
}

impl<V: Send + Sync + 'static> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> Drop for Cache<V> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<V: Send + Sync + 'static> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("buckets", &self.index.buckets().len())
            .field("items", &self.item_count())
            .finish()
    }
}
