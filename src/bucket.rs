//! One shard of the key space.
//!
//! A [`Bucket`] owns a hash map from key to shared entry under a
//! reader/writer lock. Lookups take the shared lock; every mutation takes
//! the exclusive lock. No recency, expiry, or accounting logic lives here;
//! the facade forwards the entries a mutation displaces to the worker.
//!
//! Key-to-shard selection hashes the key bytes with `FxHasher` and masks
//! with `buckets − 1`. The mapping is deterministic across runs, which the
//! end-to-end tests rely on.

use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockWriteGuard};
use rustc_hash::{FxHashMap, FxHasher};

use crate::entry::Entry;

/// Stable hash of a key's bytes, used for shard selection.
pub(crate) fn key_hash(key: &str) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish() as u32
}

pub(crate) type Lookup<V> = FxHashMap<Box<str>, Arc<Entry<V>>>;

/// A single shard: key → entry map behind a `RwLock`.
pub(crate) struct Bucket<V> {
    lookup: RwLock<Lookup<V>>,
}

impl<V> Bucket<V> {
    pub(crate) fn new() -> Self {
        Self {
            lookup: RwLock::new(FxHashMap::default()),
        }
    }

    /// Looks the key up under the shared lock.
    pub(crate) fn get(&self, key: &str) -> Option<Arc<Entry<V>>> {
        self.lookup.read().get(key).cloned()
    }

    /// Inserts a freshly built entry, returning it along with whatever
    /// entry the key previously mapped to. The displaced entry must be
    /// forwarded to the worker so it leaves the recency list.
    pub(crate) fn set(
        &self,
        key: &str,
        value: V,
        ttl: Duration,
        size: i64,
        track: bool,
        group: Option<Arc<str>>,
    ) -> (Arc<Entry<V>>, Option<Arc<Entry<V>>>) {
        let entry = Arc::new(Entry::new(key, group, value, ttl, size, track));
        let existing = self.lookup.write().insert(key.into(), Arc::clone(&entry));
        (entry, existing)
    }

    /// Swaps the value of an existing entry in place and returns the size
    /// delta, or `None` if the key is absent. TTL and recency are
    /// untouched.
    pub(crate) fn replace(&self, key: &str, value: V, size: i64) -> Option<i64> {
        let lookup = self.lookup.write();
        let entry = lookup.get(key)?;
        entry.set_value(value);
        Some(entry.set_size(size))
    }

    /// Removes the key and returns its entry for the deletions channel.
    pub(crate) fn delete(&self, key: &str) -> Option<Arc<Entry<V>>> {
        self.lookup.write().remove(key)
    }

    /// Removes every key starting with `prefix`; the caller forwards the
    /// returned entries to the deletions channel after the lock is gone.
    pub(crate) fn delete_prefix(&self, prefix: &str) -> Vec<Arc<Entry<V>>> {
        self.delete_matching(&mut |key, _| key.starts_with(prefix))
    }

    /// Removes every entry the predicate matches; same contract as
    /// [`Bucket::delete_prefix`].
    pub(crate) fn delete_matching<F>(&self, matches: &mut F) -> Vec<Arc<Entry<V>>>
    where
        F: FnMut(&str, &Arc<Entry<V>>) -> bool,
    {
        let mut lookup = self.lookup.write();
        let mut keys = Vec::new();
        for (key, entry) in lookup.iter() {
            if matches(key, entry) {
                keys.push(key.clone());
            }
        }
        keys.iter()
            .filter_map(|key| lookup.remove(key.as_ref()))
            .collect()
    }

    /// Visits entries under the shared lock until `f` returns `false`;
    /// reports whether iteration ran to completion.
    pub(crate) fn for_each<F>(&self, f: &mut F) -> bool
    where
        F: FnMut(&str, &Arc<Entry<V>>) -> bool,
    {
        for (key, entry) in self.lookup.read().iter() {
            if !f(key, entry) {
                return false;
            }
        }
        true
    }

    /// Drops every entry in the shard.
    pub(crate) fn clear(&self) {
        *self.lookup.write() = FxHashMap::default();
    }

    /// Number of keys in the shard.
    pub(crate) fn len(&self) -> usize {
        self.lookup.read().len()
    }

    /// Exclusive access for operations that must hold every shard lock at
    /// once (`Clear`).
    pub(crate) fn write_guard(&self) -> RwLockWriteGuard<'_, Lookup<V>> {
        self.lookup.write()
    }
}
