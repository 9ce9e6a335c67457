//! Derived cache of patched assets.
//!
//! ```text
//! <cache_dir>/
//!   mod-cache.json       path -> {lastmodified, patchHash}
//!   _patched/kcs2/...    patched bytes, mirroring canonical paths
//! ```

use crate::error::PatchResult;
use bytes::Bytes;
use kccp_cache::{
    IndexStore, PatchedRecord, location::cache_file_for, persist::atomic_write,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::fs;
use tracing::{debug, warn};

/// Index document of the derived cache
pub const PATCHED_INDEX_FILE: &str = "mod-cache.json";

/// Directory holding patched bytes under the cache root
pub const PATCHED_DIR: &str = "_patched";

/// Patched bytes keyed by canonical path and validated by patch hash
#[derive(Debug)]
pub struct PatchedCache {
    root: PathBuf,
    index: Arc<IndexStore<PatchedRecord>>,
}

impl PatchedCache {
    /// Open the derived cache of the cache at `cache_dir`.
    pub async fn open(cache_dir: &Path, debounce: Duration, backpressure: usize) -> Self {
        let index = IndexStore::load(cache_dir.join(PATCHED_INDEX_FILE))
            .await
            .with_schedule(debounce, backpressure);
        Self {
            root: cache_dir.join(PATCHED_DIR),
            index: Arc::new(index),
        }
    }

    /// The patched index
    pub fn index(&self) -> &Arc<IndexStore<PatchedRecord>> {
        &self.index
    }

    /// Where the patched bytes of `path` live
    pub fn file_for(&self, path: &str) -> PathBuf {
        cache_file_for(&self.root, path)
    }

    /// Patched bytes for `path`, if they were computed from the same inputs.
    pub async fn get(
        &self,
        path: &str,
        patch_hash: &str,
        lastmodified: Option<&str>,
    ) -> Option<Bytes> {
        let record = self.index.get(path)?;
        if !record.is_current(patch_hash, lastmodified) {
            debug!("Patched copy of {} is outdated", path);
            return None;
        }
        match fs::read(self.file_for(path)).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                warn!("Patched copy of {} unreadable: {}", path, e);
                None
            }
        }
    }

    /// Store patched bytes and schedule an index save.
    pub async fn put(
        &self,
        path: &str,
        bytes: &[u8],
        patch_hash: &str,
        lastmodified: Option<&str>,
    ) -> PatchResult<()> {
        atomic_write(&self.file_for(path), bytes).await?;
        self.index.insert(
            path,
            PatchedRecord {
                lastmodified: lastmodified.map(ToString::to_string),
                patch_hash: patch_hash.to_string(),
            },
        );
        self.index.queue_save();
        Ok(())
    }

    /// Save the index now.
    pub async fn flush(&self) -> PatchResult<()> {
        Ok(self.index.flush().await?)
    }
}
