//! Cache entries and the pinning guard.
//!
//! An [`Entry`] is shared between the shard that indexes it, the recency
//! list owned by the worker, and any caller still holding it after a `get`.
//! Most fields are immutable after construction; the mutable ones are
//! narrow and each has a single writer:
//!
//! - `value` and `size` change only under the owning shard's exclusive lock
//!   (`replace`),
//! - `expires` is an atomic deadline so `extend` can race with readers,
//! - `promotions` and the list node pointer are written only by the worker,
//! - `ref_count` is bumped by callers and read by the worker's GC.
//!
//! Expiry is tracked as nanoseconds on a process-wide monotonic clock; an
//! entry with `expires <= now` is stale but still returned by `get` so the
//! caller can decide via [`Entry::expired`] / [`Entry::ttl`].

use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::list::ListNode;

/// Promotion counter value for an entry the worker has not linked yet.
pub(crate) const FRESH: i32 = -1;

/// Terminal promotion counter value: the entry left the list (or never
/// joined it) and must not be re-linked.
pub(crate) const TOMBSTONE: i32 = -2;

fn clock_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds elapsed on the process-wide monotonic clock.
pub(crate) fn now_nanos() -> u64 {
    clock_epoch().elapsed().as_nanos() as u64
}

/// Absolute deadline `ttl` from now, saturating at the clock's horizon.
pub(crate) fn deadline_after(ttl: Duration) -> u64 {
    now_nanos().saturating_add(u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX))
}

/// A single cached key/value pair.
///
/// Returned as `Arc<Entry<V>>` from cache lookups; remains valid (and
/// readable) even after the entry has been deleted or evicted.
pub struct Entry<V> {
    key: Box<str>,
    group: Option<Arc<str>>,
    value: RwLock<V>,
    expires: AtomicU64,
    size: AtomicI64,
    promotions: AtomicI32,
    ref_count: AtomicI32,
    node: AtomicPtr<ListNode<V>>,
}

impl<V> Entry<V> {
    pub(crate) fn new(
        key: &str,
        group: Option<Arc<str>>,
        value: V,
        ttl: Duration,
        size: i64,
        tracked: bool,
    ) -> Self {
        Self {
            key: key.into(),
            group,
            value: RwLock::new(value),
            expires: AtomicU64::new(deadline_after(ttl)),
            size: AtomicI64::new(size),
            promotions: AtomicI32::new(FRESH),
            ref_count: AtomicI32::new(if tracked { 1 } else { 0 }),
            node: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The entry's key within its (secondary, for layered caches) keyspace.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The primary key for layered-cache entries, `None` for flat ones.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Runs `f` against a shared borrow of the value.
    pub fn with_value<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&self.value.read())
    }

    /// The entry's weight in the cache's accounting units (1 without a
    /// configured weigher).
    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the entry's TTL has elapsed. Expired entries are still
    /// returned by `get`; they are only refused by `fetch`.
    pub fn expired(&self) -> bool {
        now_nanos() >= self.expires.load(Ordering::Relaxed)
    }

    /// Remaining time to live, zero once expired.
    pub fn ttl(&self) -> Duration {
        let expires = self.expires.load(Ordering::Relaxed);
        Duration::from_nanos(expires.saturating_sub(now_nanos()))
    }

    /// The absolute instant at which the entry expires.
    pub fn expires_at(&self) -> Instant {
        clock_epoch() + Duration::from_nanos(self.expires.load(Ordering::Relaxed))
    }

    /// Pushes the deadline to `ttl` from now. The entry's list position is
    /// unaffected.
    pub fn extend(&self, ttl: Duration) {
        self.expires.store(deadline_after(ttl), Ordering::Relaxed);
    }

    pub(crate) fn set_value(&self, value: V) {
        *self.value.write() = value;
    }

    /// Stores a new size and returns the delta against the previous one.
    pub(crate) fn set_size(&self, size: i64) -> i64 {
        size - self.size.swap(size, Ordering::Relaxed)
    }

    /// Worker-side promotion gate: increments the counter and reports
    /// whether it just hit `gate`.
    pub(crate) fn should_promote(&self, gate: i32) -> bool {
        self.promotions.fetch_add(1, Ordering::Relaxed) + 1 == gate
    }

    pub(crate) fn reset_promotions(&self) {
        self.promotions.store(0, Ordering::Relaxed);
    }

    pub(crate) fn tombstone(&self) {
        self.promotions.store(TOMBSTONE, Ordering::Relaxed);
    }

    pub(crate) fn is_tombstoned(&self) -> bool {
        self.promotions.load(Ordering::Relaxed) == TOMBSTONE
    }

    pub(crate) fn track(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn untrack(&self) {
        self.ref_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Whether the worker has linked this entry into the recency list.
    pub(crate) fn in_list(&self) -> bool {
        !self.node.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn node_ptr(&self) -> *mut ListNode<V> {
        self.node.load(Ordering::Acquire)
    }

    pub(crate) fn set_node(&self, node: *mut ListNode<V>) {
        self.node.store(node, Ordering::Release);
    }

    pub(crate) fn take_node(&self) -> *mut ListNode<V> {
        self.node.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

impl<V: Clone> Entry<V> {
    /// Returns a clone of the cached value.
    pub fn value(&self) -> V {
        self.value.read().clone()
    }
}

impl<V> fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("group", &self.group)
            .field("size", &self.size())
            .field("expired", &self.expired())
            .finish()
    }
}

/// A pinned entry handle handed out by the `tracking_*` operations.
///
/// While at least one `TrackedEntry` for an entry is alive, GC skips the
/// entry no matter how stale its list position is. Dropping the handle
/// releases the pin; [`TrackedEntry::release`] is the explicit spelling.
pub struct TrackedEntry<V> {
    entry: Arc<Entry<V>>,
}

impl<V> TrackedEntry<V> {
    /// Wraps an entry whose pin count already includes this handle.
    pub(crate) fn adopt(entry: Arc<Entry<V>>) -> Self {
        Self { entry }
    }

    /// The underlying shared entry.
    pub fn as_entry(&self) -> &Arc<Entry<V>> {
        &self.entry
    }

    /// Releases the pin. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl<V> Deref for TrackedEntry<V> {
    type Target = Entry<V>;

    fn deref(&self) -> &Entry<V> {
        &self.entry
    }
}

impl<V> Clone for TrackedEntry<V> {
    fn clone(&self) -> Self {
        self.entry.track();
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<V> Drop for TrackedEntry<V> {
    fn drop(&mut self) {
        self.entry.untrack();
    }
}

impl<V> fmt::Debug for TrackedEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TrackedEntry").field(&*self.entry).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: i32, ttl: Duration) -> Entry<i32> {
        Entry::new("k", None, value, ttl, 1, false)
    }

    #[test]
    fn fresh_entry_state() {
        let e = entry(1, Duration::from_secs(60));
        assert_eq!(e.key(), "k");
        assert_eq!(e.group(), None);
        assert_eq!(e.size(), 1);
        assert_eq!(e.ref_count(), 0);
        assert!(!e.in_list());
        assert!(!e.is_tombstoned());
        assert_eq!(e.promotions.load(Ordering::Relaxed), FRESH);
    }

    #[test]
    fn zero_ttl_is_immediately_expired() {
        let e = entry(1, Duration::ZERO);
        assert!(e.expired());
        assert_eq!(e.ttl(), Duration::ZERO);
    }

    #[test]
    fn future_deadline_reports_remaining_ttl() {
        let e = entry(1, Duration::from_secs(60));
        assert!(!e.expired());
        let ttl = e.ttl();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(59));
        assert!(e.expires_at() > Instant::now());
    }

    #[test]
    fn extend_pushes_the_deadline() {
        let e = entry(1, Duration::ZERO);
        assert!(e.expired());
        e.extend(Duration::from_secs(30));
        assert!(!e.expired());
        assert!(e.ttl() > Duration::from_secs(29));
    }

    #[test]
    fn promotion_gate_fires_once_per_cycle() {
        let e = entry(1, Duration::from_secs(60));
        e.reset_promotions();
        assert!(!e.should_promote(3));
        assert!(!e.should_promote(3));
        assert!(e.should_promote(3));
        e.reset_promotions();
        assert!(!e.should_promote(3));
        assert!(!e.should_promote(3));
        assert!(e.should_promote(3));
    }

    #[test]
    fn tombstone_is_observable() {
        let e = entry(1, Duration::from_secs(60));
        e.tombstone();
        assert!(e.is_tombstoned());
    }

    #[test]
    fn value_and_size_mutation() {
        let e = entry(10, Duration::from_secs(60));
        assert_eq!(e.value(), 10);
        e.set_value(20);
        assert_eq!(e.with_value(|v| *v), 20);
        assert_eq!(e.set_size(5), 4);
        assert_eq!(e.size(), 5);
        assert_eq!(e.set_size(2), -3);
    }

    #[test]
    fn tracked_entry_releases_on_drop() {
        let e = Arc::new(Entry::new("k", None, 1, Duration::from_secs(60), 1, true));
        assert_eq!(e.ref_count(), 1);

        let handle = TrackedEntry::adopt(Arc::clone(&e));
        let second = handle.clone();
        assert_eq!(e.ref_count(), 2);

        drop(handle);
        assert_eq!(e.ref_count(), 1);
        second.release();
        assert_eq!(e.ref_count(), 0);
    }
}
