//! Error types for cache operations

use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error during cache operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Index document could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Origin could not be reached
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Origin answered with an error status and no cached copy was available
    #[error("Upstream returned HTTP {status}")]
    UpstreamStatus {
        /// Status reported by the origin
        status: StatusCode,
    },

    /// Origin answered "not modified" but there is nothing on disk to serve
    #[error("Origin reported {path} as not modified but no cached copy exists")]
    NotModifiedWithoutCopy {
        /// Canonical asset path
        path: String,
    },

    /// Request URL could not be mapped to a cache location
    #[error("Invalid asset URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Cached file length does not match the recorded length
    #[error("Cache corruption detected for {path}: expected {expected} bytes, found {actual}")]
    Corruption {
        /// Canonical asset path
        path: String,
        /// Length stored in the index
        expected: u64,
        /// Length found on disk
        actual: u64,
    },

    /// A foreign cache is missing its index document
    #[error("Missing cache index at {0}")]
    MissingIndex(PathBuf),

    /// Package could not be read or written
    #[error("Archive error: {0}")]
    Archive(String),

    /// Invalid cache configuration
    #[error("Invalid cache configuration: {0}")]
    InvalidConfiguration(String),

    /// Background task failed to complete
    #[error("Task failed: {0}")]
    Task(String),
}

impl CacheError {
    /// Whether the error means the origin itself was unreachable.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
