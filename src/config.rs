//! Cache configuration.
//!
//! A [`Configuration`] is built by chaining setters and handed to
//! [`Cache::with_config`](crate::cache::Cache::with_config) or
//! [`LayeredCache::with_config`](crate::layered::LayeredCache::with_config).
//!
//! | Option | Default | Effect |
//! |---|---|---|
//! | `buckets` | 16 | Shard count, snapped into {1, 2, 4, 8, 16} |
//! | `max_size` | 5000 | Eviction threshold, in weigher units (item count without a weigher) |
//! | `items_to_prune` | 500 | Count-mode eviction batch size |
//! | `percent_to_prune` | off | Size-mode prune target: `max_size − max_size·pct/100` |
//! | `delete_buffer` | 1024 | Deletions channel capacity (senders block when full) |
//! | `promote_buffer` | 1024 | Promotions channel capacity (hints are dropped when full) |
//! | `gets_per_promote` | 3 | Gets coalesced into one recency move |
//! | `track` | off | Reference-counted pinning via the `tracking_*` operations |
//! | `on_delete` | none | Callback run by the worker for every delete and eviction |
//! | `weigh_with` | none | Per-entry size function; absent, every entry weighs 1 |
//!
//! ## Example Usage
//!
//! ```
//! use shardlru::cache::Cache;
//! use shardlru::config::Configuration;
//!
//! let cache: Cache<String> = Cache::with_config(
//!     Configuration::new()
//!         .buckets(4)
//!         .max_size(10_000)
//!         .items_to_prune(100)
//!         .gets_per_promote(5),
//! )
//! .unwrap();
//! ```

use std::fmt;
use std::sync::Arc;

use crate::entry::Entry;
use crate::error::ConfigError;
use crate::weight::{Weighted, Weigher};

/// Callback invoked by the worker just before an entry is unlinked.
pub type DeleteCallback<V> = Arc<dyn Fn(&Entry<V>) + Send + Sync>;

const MAX_BUCKETS: u32 = 16;

/// Snaps a shard count into the supported power-of-two set {1, 2, 4, 8, 16}.
///
/// In-range values round up to the next power of two; zero and anything
/// above 16 snap to 16.
fn snap_buckets(count: u32) -> u32 {
    if count == 0 || count > MAX_BUCKETS {
        MAX_BUCKETS
    } else {
        count.next_power_of_two()
    }
}

/// Construction parameters for [`Cache`](crate::cache::Cache) and
/// [`LayeredCache`](crate::layered::LayeredCache).
///
/// Setters consume and return the configuration so they can be chained.
pub struct Configuration<V> {
    pub(crate) buckets: u32,
    pub(crate) max_size: i64,
    pub(crate) items_to_prune: usize,
    pub(crate) percent_to_prune: Option<u8>,
    pub(crate) delete_buffer: usize,
    pub(crate) promote_buffer: usize,
    pub(crate) gets_per_promote: i32,
    pub(crate) tracking: bool,
    pub(crate) weigher: Option<Weigher<V>>,
    pub(crate) on_delete: Option<DeleteCallback<V>>,
}

impl<V> Configuration<V> {
    /// Creates a configuration with the default settings listed in the
    /// module table.
    pub fn new() -> Self {
        Self {
            buckets: MAX_BUCKETS,
            max_size: 5000,
            items_to_prune: 500,
            percent_to_prune: None,
            delete_buffer: 1024,
            promote_buffer: 1024,
            gets_per_promote: 3,
            tracking: false,
            weigher: None,
            on_delete: None,
        }
    }

    /// Sets the shard count, snapped into {1, 2, 4, 8, 16}.
    pub fn buckets(mut self, count: u32) -> Self {
        self.buckets = snap_buckets(count);
        self
    }

    /// Sets the eviction threshold, in weigher units (or items without a
    /// weigher). Must be positive.
    pub fn max_size(mut self, size: i64) -> Self {
        self.max_size = size;
        self
    }

    /// Sets how many list entries one count-mode GC pass examines, at
    /// minimum.
    pub fn items_to_prune(mut self, count: usize) -> Self {
        self.items_to_prune = count;
        self
    }

    /// Switches GC to size mode: each pass evicts until the total weight
    /// drops to `max_size − max_size·pct/100`.
    pub fn percent_to_prune(mut self, pct: u8) -> Self {
        self.percent_to_prune = Some(pct);
        self
    }

    /// Sets the deletions channel capacity. Senders block when it is full.
    pub fn delete_buffer(mut self, capacity: usize) -> Self {
        self.delete_buffer = capacity;
        self
    }

    /// Sets the promotions channel capacity. Promotion hints are dropped
    /// when it is full.
    pub fn promote_buffer(mut self, capacity: usize) -> Self {
        self.promote_buffer = capacity;
        self
    }

    /// Sets how many gets are coalesced into a single recency move.
    pub fn gets_per_promote(mut self, gets: i32) -> Self {
        self.gets_per_promote = gets;
        self
    }

    /// Enables reference-counted pinning. Entries pinned through
    /// `tracking_get`/`tracking_set` are skipped by GC until released.
    pub fn track(mut self) -> Self {
        self.tracking = true;
        self
    }

    /// Registers a callback run by the worker for every explicit delete and
    /// every eviction, just before the entry is unlinked.
    pub fn on_delete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Entry<V>) + Send + Sync + 'static,
    {
        self.on_delete = Some(Arc::new(callback));
        self
    }

    /// Sets the per-entry weight function used for size accounting.
    pub fn weigh_with<F>(mut self, weigher: F) -> Self
    where
        F: Fn(&V) -> i64 + Send + Sync + 'static,
    {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Weighs entries through the value type's own [`Weighted`] impl.
    pub fn weigh_by_capability(self) -> Self
    where
        V: Weighted + 'static,
    {
        self.weigh_with(V::weight)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size <= 0 {
            return Err(ConfigError::invalid(
                "max_size",
                format!("must be greater than zero, got {}", self.max_size),
            ));
        }
        if let Some(pct) = self.percent_to_prune {
            if pct > 100 {
                return Err(ConfigError::invalid(
                    "percent_to_prune",
                    format!("must be at most 100, got {pct}"),
                ));
            }
        }
        if self.gets_per_promote < 1 {
            return Err(ConfigError::invalid(
                "gets_per_promote",
                format!("must be at least 1, got {}", self.gets_per_promote),
            ));
        }
        if self.delete_buffer == 0 {
            return Err(ConfigError::invalid(
                "delete_buffer",
                "channel capacity must be at least 1",
            ));
        }
        if self.promote_buffer == 0 {
            return Err(ConfigError::invalid(
                "promote_buffer",
                "channel capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

impl<V> Default for Configuration<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Configuration<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("buckets", &self.buckets)
            .field("max_size", &self.max_size)
            .field("items_to_prune", &self.items_to_prune)
            .field("percent_to_prune", &self.percent_to_prune)
            .field("delete_buffer", &self.delete_buffer)
            .field("promote_buffer", &self.promote_buffer)
            .field("gets_per_promote", &self.gets_per_promote)
            .field("tracking", &self.tracking)
            .field("weigher", &self.weigher.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}
