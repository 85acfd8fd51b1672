//! The layered cache: a two-level `(primary, secondary)` keyspace.
//!
//! Each shard holds a map from primary key to an inner [`Bucket`], so a
//! primary key groups arbitrarily many secondary entries that can be
//! dropped together with [`LayeredCache::delete_all`]. Entries from every
//! primary share one recency list, one size total, and one worker; an
//! entry's group only matters when it has to be removed from its shard.
//!
//! [`SecondaryCache`] binds a primary's inner bucket once so repeated
//! access under the same primary skips the outer lookup.
//!
//! ## Example Usage
//!
//! ```
//! use std::time::Duration;
//! use shardlru::layered::LayeredCache;
//!
//! let cache = LayeredCache::new();
//! let ttl = Duration::from_secs(60);
//!
//! cache.set("spice", "flow", 1, ttl);
//! cache.set("spice", "must", 2, ttl);
//! cache.set("leto", "sister", 3, ttl);
//!
//! assert_eq!(cache.get("spice", "flow").unwrap().value(), 1);
//! assert!(cache.delete_all("spice"));
//! cache.sync_updates();
//! assert!(cache.get("spice", "must").is_none());
//! assert_eq!(cache.get("leto", "sister").unwrap().value(), 3);
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::bucket::{key_hash, Bucket};
use crate::config::Configuration;
use crate::entry::{Entry, TrackedEntry};
use crate::error::ConfigError;
use crate::weight::Weigher;
use crate::worker::{self, Channels, EntryIndex, Event};

/// One shard of the primary keyspace: primary key → inner bucket.
pub(crate) struct LayeredBucket<V> {
    buckets: RwLock<FxHashMap<Arc<str>, Arc<Bucket<V>>>>,
}

impl<V> LayeredBucket<V> {
    fn new() -> Self {
        Self {
            buckets: RwLock::new(FxHashMap::default()),
        }
    }

    fn bucket(&self, primary: &str) -> Option<Arc<Bucket<V>>> {
        self.buckets.read().get(primary).cloned()
    }

    /// Returns the inner bucket for `primary`, creating it on first use.
    /// The returned key is the shared spelling stored in entry groups.
    fn get_or_create(&self, primary: &str) -> (Arc<str>, Arc<Bucket<V>>) {
        {
            let buckets = self.buckets.read();
            if let Some((key, bucket)) = buckets.get_key_value(primary) {
                return (Arc::clone(key), Arc::clone(bucket));
            }
        }
        let mut buckets = self.buckets.write();
        if let Some((key, bucket)) = buckets.get_key_value(primary) {
            return (Arc::clone(key), Arc::clone(bucket));
        }
        let key: Arc<str> = Arc::from(primary);
        let bucket = Arc::new(Bucket::new());
        buckets.insert(Arc::clone(&key), Arc::clone(&bucket));
        (key, bucket)
    }

    fn get(&self, primary: &str, secondary: &str) -> Option<Arc<Entry<V>>> {
        self.bucket(primary)?.get(secondary)
    }

    fn set(
        &self,
        primary: &str,
        secondary: &str,
        value: V,
        ttl: Duration,
        size: i64,
        track: bool,
    ) -> (Arc<Entry<V>>, Option<Arc<Entry<V>>>) {
        let (group, bucket) = self.get_or_create(primary);
        bucket.set(secondary, value, ttl, size, track, Some(group))
    }

    fn delete(&self, primary: &str, secondary: &str) -> Option<Arc<Entry<V>>> {
        self.bucket(primary)?.delete(secondary)
    }

    fn delete_all(&self, primary: &str) -> Vec<Arc<Entry<V>>> {
        match self.bucket(primary) {
            Some(bucket) => bucket.delete_matching(&mut |_, _| true),
            None => Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.buckets.read().values().map(|b| b.len()).sum()
    }
}

/// Shard table for two-level keys; shard selection uses the primary key
/// only, so one primary's entries always share a shard.
pub(crate) struct LayeredIndex<V> {
    buckets: Box<[LayeredBucket<V>]>,
    mask: u32,
}

impl<V> LayeredIndex<V> {
    fn new(bucket_count: u32) -> Self {
        Self {
            buckets: (0..bucket_count).map(|_| LayeredBucket::new()).collect(),
            mask: bucket_count - 1,
        }
    }

    fn bucket(&self, primary: &str) -> &LayeredBucket<V> {
        &self.buckets[(key_hash(primary) & self.mask) as usize]
    }
}

impl<V> EntryIndex<V> for LayeredIndex<V>
where
    V: Send + Sync + 'static,
{
    fn evict(&self, entry: &Entry<V>) {
        if let Some(group) = entry.group() {
            let _ = self.bucket(group).delete(group, entry.key());
        }
    }

    fn clear_all<F: FnOnce()>(&self, drain: F) {
        let mut guards: Vec<_> = self.buckets.iter().map(|b| b.buckets.write()).collect();
        for guard in guards.iter_mut() {
            for bucket in guard.values() {
                bucket.clear();
            }
            guard.clear();
        }
        drain();
    }
}

/// A concurrent LRU cache over `(primary, secondary)` string keys.
///
/// Same machinery and guarantees as [`Cache`](crate::cache::Cache), with a
/// grouped keyspace on top: one worker, one recency list, one size budget.
pub struct LayeredCache<V: Send + Sync + 'static> {
    index: Arc<LayeredIndex<V>>,
    channels: Channels<V>,
    weigher: Option<Weigher<V>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Send + Sync + 'static> LayeredCache<V> {
    /// Creates a layered cache with the default [`Configuration`].
    pub fn new() -> Self {
        Self::with_config(Configuration::new()).expect("default configuration is valid")
    }

    /// Creates a layered cache from `config`, spawning its worker thread.
    pub fn with_config(config: Configuration<V>) -> Result<Self, ConfigError> {
        config.validate()?;
        let index = Arc::new(LayeredIndex::new(config.buckets));
        let (channels, handle) = worker::spawn(Arc::clone(&index), &config);
        Ok(Self {
            index,
            channels,
            weigher: config.weigher,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Gets an entry, or `None` if the pair is absent. Can return an
    /// expired entry, exactly like [`Cache::get`](crate::cache::Cache::get).
    pub fn get(&self, primary: &str, secondary: &str) -> Option<Arc<Entry<V>>> {
        let entry = self.index.bucket(primary).get(primary, secondary)?;
        if !entry.expired() {
            let _ = self.channels.promotables.try_send(Arc::clone(&entry));
        }
        Some(entry)
    }

    /// [`LayeredCache::get`] without the recency hint.
    pub fn get_without_promote(&self, primary: &str, secondary: &str) -> Option<Arc<Entry<V>>> {
        self.index.bucket(primary).get(primary, secondary)
    }

    /// Stores `value` under the pair for `ttl`, replacing (and retiring)
    /// any previous entry.
    pub fn set(&self, primary: &str, secondary: &str, value: V, ttl: Duration) -> Arc<Entry<V>> {
        self.insert(primary, secondary, value, ttl, false)
    }

    /// Swaps an existing entry's value in place; TTL and recency are
    /// untouched. Returns `false` if the pair is absent.
    pub fn replace(&self, primary: &str, secondary: &str, value: V) -> bool {
        let size = self.weigh(&value);
        let Some(bucket) = self.index.bucket(primary).bucket(primary) else {
            return false;
        };
        match bucket.replace(secondary, value, size) {
            Some(delta) => {
                if delta != 0 {
                    let _ = self.channels.deletables.send(Event::SizeChange(delta));
                }
                true
            }
            None => false,
        }
    }

    /// Returns the fresh entry for the pair, or produces, caches, and
    /// returns one. Producer errors propagate unchanged; nothing is
    /// cached on error.
    pub fn fetch<E>(
        &self,
        primary: &str,
        secondary: &str,
        ttl: Duration,
        produce: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<Entry<V>>, E> {
        if let Some(entry) = self.get(primary, secondary) {
            if !entry.expired() {
                return Ok(entry);
            }
        }
        let value = produce()?;
        Ok(self.set(primary, secondary, value, ttl))
    }

    /// Removes the pair; returns whether it was present.
    pub fn delete(&self, primary: &str, secondary: &str) -> bool {
        match self.index.bucket(primary).delete(primary, secondary) {
            Some(entry) => {
                let _ = self.channels.deletables.send(Event::Delete(entry));
                true
            }
            None => false,
        }
    }

    /// Removes every entry under `primary`; returns whether any existed.
    pub fn delete_all(&self, primary: &str) -> bool {
        let removed = self.index.bucket(primary).delete_all(primary);
        let any = !removed.is_empty();
        for entry in removed {
            let _ = self.channels.deletables.send(Event::Delete(entry));
        }
        any
    }

    /// Removes every secondary key under `primary` starting with
    /// `prefix`; returns how many were removed.
    pub fn delete_prefix(&self, primary: &str, prefix: &str) -> usize {
        self.delete_matching(primary, |key, _| key.starts_with(prefix))
    }

    /// Removes every entry under `primary` that `matches`; returns how
    /// many were removed.
    pub fn delete_matching<F>(&self, primary: &str, mut matches: F) -> usize
    where
        F: FnMut(&str, &Arc<Entry<V>>) -> bool,
    {
        let Some(bucket) = self.index.bucket(primary).bucket(primary) else {
            return 0;
        };
        let removed = bucket.delete_matching(&mut matches);
        let count = removed.len();
        for entry in removed {
            let _ = self.channels.deletables.send(Event::Delete(entry));
        }
        count
    }

    /// Visits every entry under `primary` until `f` returns `false`.
    pub fn for_each<F>(&self, primary: &str, mut f: F)
    where
        F: FnMut(&str, &Arc<Entry<V>>) -> bool,
    {
        if let Some(bucket) = self.index.bucket(primary).bucket(primary) {
            bucket.for_each(&mut f);
        }
    }

    /// Number of entries across every primary.
    pub fn item_count(&self) -> usize {
        self.index.buckets.iter().map(|b| b.len()).sum()
    }

    /// Gets and pins an entry; see
    /// [`Cache::tracking_get`](crate::cache::Cache::tracking_get).
    pub fn tracking_get(&self, primary: &str, secondary: &str) -> Option<TrackedEntry<V>> {
        let entry = self.get(primary, secondary)?;
        entry.track();
        Some(TrackedEntry::adopt(entry))
    }

    /// Stores and pins an entry in one step.
    pub fn tracking_set(
        &self,
        primary: &str,
        secondary: &str,
        value: V,
        ttl: Duration,
    ) -> TrackedEntry<V> {
        TrackedEntry::adopt(self.insert(primary, secondary, value, ttl, true))
    }

    /// Returns a view bound to `primary`'s bucket, creating the bucket if
    /// needed. The view stays valid (but detached) across a `clear`.
    pub fn get_or_create_secondary_cache(&self, primary: &str) -> SecondaryCache<V> {
        let (group, bucket) = self.index.bucket(primary).get_or_create(primary);
        SecondaryCache {
            primary: group,
            bucket,
            promotables: self.channels.promotables.clone(),
            deletables: self.channels.deletables.clone(),
            weigher: self.weigher.clone(),
        }
    }

    /// Drops every entry under every primary and resets accounting.
    pub fn clear(&self) {
        self.channels.control.clear();
    }

    /// Forces an eviction pass.
    pub fn gc(&self) {
        self.channels.control.gc();
    }

    /// Replaces the eviction threshold.
    pub fn set_max_size(&self, size: i64) {
        self.channels.control.set_max_size(size);
    }

    /// Total weight of all listed entries.
    pub fn get_size(&self) -> i64 {
        self.channels.control.get_size()
    }

    /// Entries evicted since the last call; resets the counter.
    pub fn get_dropped(&self) -> usize {
        self.channels.control.get_dropped()
    }

    /// Per-calling-thread barrier; see
    /// [`Cache::sync_updates`](crate::cache::Cache::sync_updates).
    pub fn sync_updates(&self) {
        self.channels.control.sync_updates();
    }

    /// Stops the worker; see [`Cache::stop`](crate::cache::Cache::stop).
    pub fn stop(&self) {
        self.channels.control.stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn insert(
        &self,
        primary: &str,
        secondary: &str,
        value: V,
        ttl: Duration,
        track: bool,
    ) -> Arc<Entry<V>> {
        let size = self.weigh(&value);
        let (entry, existing) = self
            .index
            .bucket(primary)
            .set(primary, secondary, value, ttl, size, track);
        if let Some(existing) = existing {
            let _ = self.channels.deletables.send(Event::Delete(existing));
        }
        let _ = self.channels.promotables.try_send(Arc::clone(&entry));
        entry
    }

    fn weigh(&self, value: &V) -> i64 {
        self.weigher.as_ref().map_or(1, |weigher| weigher(value))
    }
}

impl<V: Send + Sync + 'static> Default for LayeredCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> Drop for LayeredCache<V> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<V: Send + Sync + 'static> fmt::Debug for LayeredCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredCache")
            .field("buckets", &self.index.buckets.len())
            .field("items", &self.item_count())
            .finish()
    }
}

/// A view of a [`LayeredCache`] with the primary key bound.
///
/// Obtained from [`LayeredCache::get_or_create_secondary_cache`]. Writes
/// go through the shared worker exactly as layered writes do; `get` does
/// not send recency hints.
pub struct SecondaryCache<V: Send + Sync + 'static> {
    primary: Arc<str>,
    bucket: Arc<Bucket<V>>,
    promotables: crossbeam::channel::Sender<Arc<Entry<V>>>,
    deletables: crossbeam::channel::Sender<Event<V>>,
    weigher: Option<Weigher<V>>,
}

impl<V: Send + Sync + 'static> SecondaryCache<V> {
    /// The bound primary key.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Gets an entry under the bound primary. Does not promote.
    pub fn get(&self, secondary: &str) -> Option<Arc<Entry<V>>> {
        self.bucket.get(secondary)
    }

    /// Stores `value` under the bound primary for `ttl`.
    pub fn set(&self, secondary: &str, value: V, ttl: Duration) -> Arc<Entry<V>> {
        self.insert(secondary, value, ttl, false)
    }

    /// Swaps an existing entry's value in place; returns `false` if the
    /// secondary key is absent.
    pub fn replace(&self, secondary: &str, value: V) -> bool {
        let size = self.weigh(&value);
        match self.bucket.replace(secondary, value, size) {
            Some(delta) => {
                if delta != 0 {
                    let _ = self.deletables.send(Event::SizeChange(delta));
                }
                true
            }
            None => false,
        }
    }

    /// Removes the secondary key; returns whether it was present.
    pub fn delete(&self, secondary: &str) -> bool {
        match self.bucket.delete(secondary) {
            Some(entry) => {
                let _ = self.deletables.send(Event::Delete(entry));
                true
            }
            None => false,
        }
    }

    /// Returns the fresh entry, or produces, caches, and returns one.
    pub fn fetch<E>(
        &self,
        secondary: &str,
        ttl: Duration,
        produce: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<Entry<V>>, E> {
        if let Some(entry) = self.get(secondary) {
            if !entry.expired() {
                return Ok(entry);
            }
        }
        let value = produce()?;
        Ok(self.set(secondary, value, ttl))
    }

    /// Gets and pins an entry under the bound primary.
    pub fn tracking_get(&self, secondary: &str) -> Option<TrackedEntry<V>> {
        let entry = self.get(secondary)?;
        entry.track();
        Some(TrackedEntry::adopt(entry))
    }

    fn insert(&self, secondary: &str, value: V, ttl: Duration, track: bool) -> Arc<Entry<V>> {
        let size = self.weigh(&value);
        let (entry, existing) = self.bucket.set(
            secondary,
            value,
            ttl,
            size,
            track,
            Some(Arc::clone(&self.primary)),
        );
        if let Some(existing) = existing {
            let _ = self.deletables.send(Event::Delete(existing));
        }
        let _ = self.promotables.try_send(Arc::clone(&entry));
        entry
    }

    fn weigh(&self, value: &V) -> i64 {
        self.weigher.as_ref().map_or(1, |weigher| weigher(value))
    }
}

impl<V: Send + Sync + 'static> fmt::Debug for SecondaryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryCache")
            .field("primary", &self.primary)
            .finish()
    }
}
