//! Size reporting for weight-based eviction pressure.
//!
//! By default every entry weighs 1 and `max_size` is an item count. A
//! configured weigher turns `max_size` into an aggregate weight budget
//! (e.g. bytes), so large values exert proportionally more eviction
//! pressure than small ones.
//!
//! The weigher is a plain closure over `&V`; [`Weighted`] expresses the
//! same capability on the value type itself for callers that prefer to
//! keep the size logic next to the type:
//!
//! ```
//! use shardlru::cache::Cache;
//! use shardlru::config::Configuration;
//! use shardlru::weight::Weighted;
//!
//! struct Blob(Vec<u8>);
//!
//! impl Weighted for Blob {
//!     fn weight(&self) -> i64 {
//!         self.0.len() as i64
//!     }
//! }
//!
//! let cache = Cache::with_config(
//!     Configuration::new().max_size(1_000_000).weigh_by_capability(),
//! )
//! .unwrap();
//! cache.set("blob", Blob(vec![0u8; 512]), std::time::Duration::from_secs(60));
//! ```

use std::sync::Arc;

/// Weight function applied to every stored value.
///
/// Computed once per `set`/`replace` and cached in the entry; reads never
/// re-invoke it.
pub type Weigher<V> = Arc<dyn Fn(&V) -> i64 + Send + Sync>;

/// Capability for values that can report their own weight.
///
/// Connected to a cache via
/// [`Configuration::weigh_by_capability`](crate::config::Configuration::weigh_by_capability).
pub trait Weighted {
    /// Returns this value's weight in the cache's accounting units.
    fn weight(&self) -> i64;
}
