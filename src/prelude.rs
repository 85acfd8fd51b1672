pub use crate::cache::Cache;
pub use crate::config::Configuration;
pub use crate::entry::{Entry, TrackedEntry};
pub use crate::error::ConfigError;
pub use crate::layered::{LayeredCache, SecondaryCache};
pub use crate::weight::{Weighted, Weigher};
