//! Configuration rejection errors.
//!
//! Construction is the only fallible operation the cache owns: every
//! runtime knob in [`Configuration`](crate::config::Configuration) is
//! checked once, up front, by
//! [`Cache::with_config`](crate::cache::Cache::with_config) and
//! [`LayeredCache::with_config`](crate::layered::LayeredCache::with_config).
//! Everything after that either cannot fail or, in the case of
//! [`Cache::fetch`](crate::cache::Cache::fetch), hands the producer's own
//! error type straight back to the caller.
//!
//! ## Example Usage
//!
//! ```
//! use shardlru::cache::Cache;
//! use shardlru::config::Configuration;
//!
//! // An eviction threshold of zero can never admit an entry
//! let err = Cache::<i32>::with_config(Configuration::new().max_size(0)).unwrap_err();
//! assert_eq!(err.parameter(), "max_size");
//! assert!(err.to_string().contains("max_size"));
//! ```

use std::fmt;

/// A [`Configuration`](crate::config::Configuration) parameter the cache
/// cannot honor.
///
/// Carries the name of the offending parameter separately from the
/// rejection reason, so callers that wire configuration in from external
/// settings can report exactly which knob to fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    parameter: &'static str,
    reason: String,
}

impl ConfigError {
    /// Rejects `parameter` for `reason`. Only validation in
    /// `Configuration` produces these.
    pub(crate) fn invalid(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self {
            parameter,
            reason: reason.into(),
        }
    }

    /// The configuration parameter that failed validation.
    pub fn parameter(&self) -> &str {
        self.parameter
    }

    /// Why the parameter was rejected.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid `{}`: {}", self.parameter, self.reason)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn rejection(config: Configuration<i32>) -> ConfigError {
        config.validate().unwrap_err()
    }

    #[test]
    fn zero_max_size_names_the_parameter() {
        let err = rejection(Configuration::new().max_size(0));
        assert_eq!(err.parameter(), "max_size");
        assert!(err.reason().contains("greater than zero"));
        assert_eq!(err.to_string(), "invalid `max_size`: must be greater than zero, got 0");
    }

    #[test]
    fn oversized_percent_reports_the_value() {
        let err = rejection(Configuration::new().percent_to_prune(150));
        assert_eq!(err.parameter(), "percent_to_prune");
        assert!(err.reason().contains("150"));
    }

    #[test]
    fn zero_promotion_gate_is_rejected() {
        let err = rejection(Configuration::new().gets_per_promote(0));
        assert_eq!(err.parameter(), "gets_per_promote");
        assert!(err.reason().contains("at least 1"));
    }

    #[test]
    fn empty_buffers_name_the_offending_channel() {
        let err = rejection(Configuration::new().delete_buffer(0));
        assert_eq!(err.parameter(), "delete_buffer");

        let err = rejection(Configuration::new().promote_buffer(0));
        assert_eq!(err.parameter(), "promote_buffer");
    }

    #[test]
    fn identical_rejections_compare_equal() {
        let a = rejection(Configuration::new().max_size(0));
        let b = rejection(Configuration::new().max_size(0));
        assert_eq!(a, b.clone());
        assert_ne!(a, rejection(Configuration::new().max_size(-1)));
    }

    #[test]
    fn rejections_box_as_std_errors() {
        let err: Box<dyn std::error::Error> =
            Box::new(rejection(Configuration::new().percent_to_prune(200)));
        assert!(err.to_string().starts_with("invalid `percent_to_prune`"));
    }
}
