//! Index record types.
//!
//! Field names match the on-disk documents (`cached.json`, `mod-cache.json`)
//! so existing caches load without conversion.

use serde::{Deserialize, Serialize};

/// Metadata for one cached asset, keyed by canonical path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Client-supplied cache-busting token, including the leading `?`
    #[serde(default)]
    pub version: String,

    /// Origin `Last-Modified` value, used as the revalidation token
    #[serde(default)]
    pub lastmodified: Option<String>,

    /// Byte length of the cached body (absent for legacy records)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    /// Origin `Cache-Control` directive
    #[serde(default)]
    pub cache: Option<String>,
}

impl CacheRecord {
    /// Whether a request carrying `version` may be served from this record.
    ///
    /// A bare `?` or an empty token always matches: one client code path
    /// requests assets without its usual version suffix.
    pub fn version_matches(&self, version: &str) -> bool {
        version.is_empty() || version == "?" || self.version == version
    }

    /// Whether the origin asked for the asset never to be stored by browsers.
    pub fn forbids_browser_cache(&self) -> bool {
        matches!(self.cache.as_deref(), Some("no-cache" | "no-store"))
    }
}

/// Metadata for one patched asset in the derived cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchedRecord {
    /// `lastmodified` of the source record the patch was computed from
    #[serde(default)]
    pub lastmodified: Option<String>,

    /// Digest over the contributing patch rules
    #[serde(rename = "patchHash")]
    pub patch_hash: String,
}

impl PatchedRecord {
    /// Whether this derived entry is still valid for the given inputs.
    pub fn is_current(&self, patch_hash: &str, lastmodified: Option<&str>) -> bool {
        self.patch_hash == patch_hash && self.lastmodified.as_deref() == lastmodified
    }
}
