//! Cache engine configuration
//!
//! Defaults reproduce the behaviour game clients expect from the proxy: a
//! five second save debounce, a short list of pages that must never be served
//! from disk, and the two version-critical files that are force-refetched
//! once the origin has been seen misbehaving.

use crate::error::{CacheError, CacheResult};
use std::{path::PathBuf, time::Duration};

/// Default cache-index debounce
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Scheduled mutations after which the debounce stops being extended
pub const DEFAULT_SAVE_BACKPRESSURE: usize = 25;

/// Concurrent file operations for verification, merge and diff
pub const DEFAULT_FAN_OUT: usize = 32;

/// Default timeout for upstream requests
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Canonical path prefixes that are always refetched from the origin
pub const DEFAULT_NO_CACHE_PREFIXES: &[&str] = &[
    "/gadget_html5/",
    "/kcscontents/information/index.html",
    "/kcscontents/news/",
];

/// Version-critical files force-refetched after an origin failure
pub const DEFAULT_INVALIDATED_PATHS: &[&str] = &["/kcs2/version.json", "/kcs2/js/main.js"];

/// Name of the index document inside the cache directory
pub const INDEX_FILE_NAME: &str = "cached.json";

/// Configuration for [`CacheEngine`](crate::CacheEngine)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Root directory for cached files and `cached.json`
    pub cache_dir: PathBuf,
    /// Re-check file length on every disk-served hit
    pub verify_cache: bool,
    /// Tell clients not to keep their own copies
    pub disable_browser_cache: bool,
    /// Connect/read timeout for origin requests
    pub upstream_timeout: Duration,
    /// Delay between the last index mutation and the save
    pub save_debounce: Duration,
    /// Pending mutation count that stops deferring the save
    pub save_backpressure: usize,
    /// Concurrency limit for bulk maintenance operations
    pub fan_out: usize,
    /// Path prefixes never served from disk
    pub no_cache_prefixes: Vec<String>,
    /// Paths refetched once the reachability flag is raised
    pub invalidated_paths: Vec<String>,
}

impl CacheConfig {
    /// Create a configuration rooted at `cache_dir` with default tuning
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            verify_cache: false,
            disable_browser_cache: false,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            save_debounce: DEFAULT_SAVE_DEBOUNCE,
            save_backpressure: DEFAULT_SAVE_BACKPRESSURE,
            fan_out: DEFAULT_FAN_OUT,
            no_cache_prefixes: DEFAULT_NO_CACHE_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
            invalidated_paths: DEFAULT_INVALIDATED_PATHS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Enable length verification on disk-served hits
    pub fn with_verify_cache(mut self, enabled: bool) -> Self {
        self.verify_cache = enabled;
        self
    }

    /// Send `no-store` on every response
    pub fn with_disable_browser_cache(mut self, disabled: bool) -> Self {
        self.disable_browser_cache = disabled;
        self
    }

    /// Set the upstream timeout
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Set the index save debounce
    pub fn with_save_debounce(mut self, debounce: Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    /// Set the back-pressure threshold for debounced saves
    pub fn with_save_backpressure(mut self, count: usize) -> Self {
        self.save_backpressure = count;
        self
    }

    /// Set the maintenance fan-out limit
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }

    /// Replace the no-cache prefix list
    pub fn with_no_cache_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_cache_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the version-critical path list
    pub fn with_invalidated_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidated_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Path of the index document
    pub fn index_path(&self) -> PathBuf {
        self.cache_dir.join(INDEX_FILE_NAME)
    }

    /// Whether `path` must always be fetched from the origin
    pub fn is_no_cache(&self, path: &str) -> bool {
        self.no_cache_prefixes.iter().any(|p| path.starts_with(p))
    }

    /// Whether `path` is one of the version-critical files
    pub fn is_invalidatable(&self, path: &str) -> bool {
        self.invalidated_paths.iter().any(|p| p == path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> CacheResult<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "cache_dir must not be empty".to_string(),
            ));
        }
        if self.upstream_timeout.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "upstream_timeout must be greater than 0".to_string(),
            ));
        }
        if self.fan_out == 0 {
            return Err(CacheError::InvalidConfiguration(
                "fan_out must be greater than 0".to_string(),
            ));
        }
        if self.save_backpressure == 0 {
            return Err(CacheError::InvalidConfiguration(
                "save_backpressure must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
