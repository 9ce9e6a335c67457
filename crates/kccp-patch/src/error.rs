//! Error types for pack scanning and patching

use kccp_cache::CacheError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading packs or patching assets
#[derive(Debug, Error)]
pub enum PatchError {
    /// IO error while reading a pack or writing a patched asset
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest, descriptor or sidecar document could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image could not be decoded or encoded
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Frame metadata sidecar is unusable
    #[error("Invalid sidecar {path}: {reason}")]
    Sidecar {
        /// Location of the sidecar
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Patcher script failed
    #[error("Patcher {program} failed: {reason}")]
    Script {
        /// Program that was run
        program: PathBuf,
        /// Why it failed
        reason: String,
    },

    /// A pack or rule is misconfigured
    #[error("Invalid mod configuration: {0}")]
    Config(String),

    /// Derived cache failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl From<tokio::task::JoinError> for PatchError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(e))
    }
}

/// Result type for patch operations
pub type PatchResult<T> = Result<T, PatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PatchError::Config("original icon.png has no patched counterpart".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid mod configuration: original icon.png has no patched counterpart"
        );

        let err = PatchError::Script {
            program: PathBuf::from("/mods/a/patcher.sh"),
            reason: "exit status 3".to_string(),
        };
        assert!(err.to_string().contains("exit status 3"));
    }

    #[test]
    fn test_from_cache_error() {
        let err: PatchError = CacheError::Archive("broken".to_string()).into();
        assert!(matches!(err, PatchError::Cache(_)));
    }
}
