//! shardlru: a sharded LRU cache for read-heavy concurrent workloads.
//!
//! Lookups take one shard's shared lock and nothing else; recency,
//! accounting, and eviction run asynchronously on a background worker.
//! See `DESIGN.md` for internal architecture and invariants.

mod bucket;
mod list;
mod worker;

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod layered;
pub mod prelude;
pub mod weight;
