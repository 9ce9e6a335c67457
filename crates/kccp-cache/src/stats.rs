//! Request and cache counters
//!
//! Counters are updated lock-free from request tasks and can be persisted to
//! a small JSON document so totals survive restarts.

#![allow(missing_docs)]

use crate::{error::CacheResult, index::IndexStore, persist::atomic_write, record::CacheRecord};
use serde::{Deserialize, Serialize};
use std::{
    path::Path,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};
use tracing::{info, warn};

/// Counter being incremented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    /// Served straight from disk
    InCache,
    /// Downloaded from the origin
    Fetched,
    /// Revalidated with a 304
    NotModified,
    /// Origin refused or was unreachable, stale copy served
    Blocked,
    /// Request failed with nothing to fall back on
    Failed,
    /// Request not eligible for caching
    Passthrough,
    /// Plain HTTP passthrough
    PassthroughHttp,
    /// CONNECT tunnel
    PassthroughHttps,
    /// Request routed to the cache engine
    TotalHandled,
}

/// Live counters
#[derive(Debug, Default)]
pub struct CacheStats {
    in_cache: AtomicU64,
    fetched: AtomicU64,
    not_modified: AtomicU64,
    blocked: AtomicU64,
    failed: AtomicU64,
    bandwidth_saved: AtomicI64,
    passthrough: AtomicU64,
    passthrough_http: AtomicU64,
    passthrough_https: AtomicU64,
    total_handled: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`], in the persisted field layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsSnapshot {
    pub in_cache: u64,
    pub fetched: u64,
    pub not_modified: u64,
    pub blocked: u64,
    pub failed: u64,
    pub bandwidth_saved: i64,
    pub passthrough: u64,
    #[serde(rename = "passthroughHTTP")]
    pub passthrough_http: u64,
    #[serde(rename = "passthroughHTTPS")]
    pub passthrough_https: u64,
    pub total_handled: u64,
}

/// Aggregate view over the cache index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    pub cached_files: u64,
    pub cached_size: u64,
    /// Some records predate length tracking
    pub old_cache: bool,
}

impl IndexSummary {
    /// Summarize an index
    pub fn from_index(index: &IndexStore<CacheRecord>) -> Self {
        index.fold(Self::default(), |mut summary, (_, record)| {
            summary.cached_files += 1;
            match record.length {
                Some(len) => summary.cached_size += len,
                None => summary.old_cache = true,
            }
            summary
        })
    }
}

impl CacheStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Create counters seeded from a snapshot
    pub fn from_snapshot(s: StatsSnapshot) -> Self {
        Self {
            in_cache: AtomicU64::new(s.in_cache),
            fetched: AtomicU64::new(s.fetched),
            not_modified: AtomicU64::new(s.not_modified),
            blocked: AtomicU64::new(s.blocked),
            failed: AtomicU64::new(s.failed),
            bandwidth_saved: AtomicI64::new(s.bandwidth_saved),
            passthrough: AtomicU64::new(s.passthrough),
            passthrough_http: AtomicU64::new(s.passthrough_http),
            passthrough_https: AtomicU64::new(s.passthrough_https),
            total_handled: AtomicU64::new(s.total_handled),
        }
    }

    /// Load counters from `path`, starting from zero when absent or unreadable
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<StatsSnapshot>(&bytes) {
                Ok(snapshot) => {
                    info!("Loaded stats from {}", path.display());
                    Self::from_snapshot(snapshot)
                }
                Err(e) => {
                    warn!("Ignoring unreadable stats file {}: {}", path.display(), e);
                    Self::new()
                }
            },
            Err(_) => Self::new(),
        }
    }

    /// Persist the current counters
    pub async fn save(&self, path: &Path) -> CacheResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        atomic_write(path, &bytes).await?;
        info!("Saved stats to {}", path.display());
        Ok(())
    }

    /// Increment a counter by one
    pub fn record(&self, stat: Stat) {
        self.counter(stat).fetch_add(1, Ordering::Relaxed);
    }

    /// Adjust the bandwidth counter; negative when a served copy is discarded
    pub fn add_bandwidth_saved(&self, bytes: i64) {
        self.bandwidth_saved.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Current value of a counter
    pub fn get(&self, stat: Stat) -> u64 {
        self.counter(stat).load(Ordering::Relaxed)
    }

    fn counter(&self, stat: Stat) -> &AtomicU64 {
        match stat {
            Stat::InCache => &self.in_cache,
            Stat::Fetched => &self.fetched,
            Stat::NotModified => &self.not_modified,
            Stat::Blocked => &self.blocked,
            Stat::Failed => &self.failed,
            Stat::Passthrough => &self.passthrough,
            Stat::PassthroughHttp => &self.passthrough_http,
            Stat::PassthroughHttps => &self.passthrough_https,
            Stat::TotalHandled => &self.total_handled,
        }
    }

    /// Copy all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_cache: self.get(Stat::InCache),
            fetched: self.get(Stat::Fetched),
            not_modified: self.get(Stat::NotModified),
            blocked: self.get(Stat::Blocked),
            failed: self.get(Stat::Failed),
            bandwidth_saved: self.bandwidth_saved.load(Ordering::Relaxed),
            passthrough: self.get(Stat::Passthrough),
            passthrough_http: self.get(Stat::PassthroughHttp),
            passthrough_https: self.get(Stat::PassthroughHttps),
            total_handled: self.get(Stat::TotalHandled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_bandwidth() {
        let stats = CacheStats::new();
        stats.record(Stat::InCache);
        stats.record(Stat::InCache);
        stats.add_bandwidth_saved(500);
        stats.add_bandwidth_saved(-120);
        let snap = stats.snapshot();
        assert_eq!(snap.in_cache, 2);
        assert_eq!(snap.bandwidth_saved, 380);
    }

    #[test]
    fn test_snapshot_field_names() {
        let stats = CacheStats::new();
        stats.record(Stat::PassthroughHttps);
        let value = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(value["passthroughHTTPS"], 1);
        assert_eq!(value["notModified"], 0);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.json");
        let stats = CacheStats::new();
        stats.record(Stat::Fetched);
        stats.save(&path).await.unwrap();

        let loaded = CacheStats::load(&path).await;
        assert_eq!(loaded.snapshot(), stats.snapshot());
    }

    #[test]
    fn test_index_summary() {
        let index = IndexStore::empty("unused.json");
        index.insert(
            "/a",
            CacheRecord {
                length: Some(10),
                ..CacheRecord::default()
            },
        );
        index.insert("/b", CacheRecord::default());
        let summary = IndexSummary::from_index(&index);
        assert_eq!(
            summary,
            IndexSummary {
                cached_files: 2,
                cached_size: 10,
                old_cache: true
            }
        );
    }
}
