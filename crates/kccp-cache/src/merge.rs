//! Import a foreign cache into the local one.
//!
//! The source is either a cache directory or a `.tar.gz` package produced by
//! [`diff_cache`](crate::diff::diff_cache). Entries are reconciled by their
//! `lastmodified` timestamps. The operation is best-effort: each entry is
//! handled independently and failures are counted, not rolled back.

use crate::{
    config::INDEX_FILE_NAME,
    error::{CacheError, CacheResult},
    index::IndexStore,
    location::{cache_file_for, is_canonical_path},
    persist::atomic_copy,
    record::CacheRecord,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::{
    cmp::Ordering,
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use time::{OffsetDateTime, format_description::well_known::Rfc2822};
use tokio::fs;
use tracing::{error, info};

/// Per-entry outcome counts of a merge or diff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Entries left untouched
    pub skipped: usize,
    /// Entries whose file and record were transferred
    pub copied: usize,
    /// Entries whose record changed without a file transfer
    pub updated: usize,
    /// Entries that could not be processed
    pub errored: usize,
}

/// What happened to one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transfer {
    Skipped,
    Copied,
    Updated,
    Errored,
}

impl TransferReport {
    pub(crate) fn count(&mut self, transfer: Transfer) {
        match transfer {
            Transfer::Skipped => self.skipped += 1,
            Transfer::Copied => self.copied += 1,
            Transfer::Updated => self.updated += 1,
            Transfer::Errored => self.errored += 1,
        }
    }
}

/// Parse an HTTP date (`Mon, 01 Jan 2024 00:00:00 GMT`).
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    let normalized = value.strip_suffix(" GMT").map(|v| format!("{v} +0000"));
    OffsetDateTime::parse(normalized.as_deref().unwrap_or(value), &Rfc2822).ok()
}

/// Order two `lastmodified` values.
///
/// Dates are compared chronologically; values that do not parse only compare
/// as equal when they are identical.
pub fn compare_lastmodified(a: Option<&str>, b: Option<&str>) -> Option<Ordering> {
    match (a.and_then(parse_http_date), b.and_then(parse_http_date)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

/// Whether `source` looks like a packaged cache.
pub fn is_package(source: &Path) -> bool {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Unpack a package into a temporary directory.
pub async fn extract_package(source: &Path) -> CacheResult<TempDir> {
    let source = source.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let archive_error =
            |e: std::io::Error| CacheError::Archive(format!("{}: {}", source.display(), e));
        let file = std::fs::File::open(&source).map_err(archive_error)?;
        let dir = TempDir::new()?;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        archive.unpack(dir.path()).map_err(archive_error)?;
        Ok(dir)
    })
    .await?
}

/// Read an index document that must exist.
pub async fn read_foreign_index(path: &Path) -> CacheResult<HashMap<String, CacheRecord>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::MissingIndex(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

/// Merge the cache at `source` into `index` and `cache_dir`.
pub async fn merge_cache(
    index: &Arc<IndexStore<CacheRecord>>,
    cache_dir: &Path,
    source: &Path,
    fan_out: usize,
) -> CacheResult<TransferReport> {
    let extracted = if fs::metadata(source).await?.is_dir() {
        None
    } else if is_package(source) {
        Some(extract_package(source).await?)
    } else {
        return Err(CacheError::Archive(format!(
            "{} is neither a cache directory nor a .tar.gz package",
            source.display()
        )));
    };
    let root: PathBuf = extracted
        .as_ref()
        .map_or_else(|| source.to_path_buf(), |dir| dir.path().to_path_buf());

    let foreign = read_foreign_index(&root.join(INDEX_FILE_NAME)).await?;
    info!("Merging {} entries from {}", foreign.len(), source.display());

    let root = root.as_path();
    let results: Vec<(String, CacheRecord, Transfer)> = stream::iter(foreign)
        .map(|(path, incoming)| {
            let local = index.get(&path);
            async move {
                let transfer = merge_entry(root, cache_dir, &path, local.as_ref(), &incoming).await;
                (path, incoming, transfer)
            }
        })
        .buffer_unordered(fan_out)
        .collect()
        .await;

    let mut report = TransferReport::default();
    for (path, incoming, transfer) in results {
        match transfer {
            Transfer::Copied => {
                index.insert(path, incoming);
            }
            Transfer::Updated => {
                index.update(&path, |record| record.version = incoming.version);
            }
            Transfer::Skipped | Transfer::Errored => {}
        }
        report.count(transfer);
    }
    index.flush().await?;

    info!(
        "Finished merging cache! Skipped {} files. Copied {}. Updated {}. Failed {}",
        report.skipped, report.copied, report.updated, report.errored
    );
    Ok(report)
}

async fn merge_entry(
    root: &Path,
    cache_dir: &Path,
    path: &str,
    local: Option<&CacheRecord>,
    incoming: &CacheRecord,
) -> Transfer {
    if !is_canonical_path(path) {
        error!("Refusing to merge unsafe path {}", path);
        return Transfer::Errored;
    }

    let target = cache_file_for(cache_dir, path);
    if let Some(local) = local {
        let have_file = fs::try_exists(&target).await.unwrap_or(false);
        match compare_lastmodified(local.lastmodified.as_deref(), incoming.lastmodified.as_deref())
        {
            Some(Ordering::Greater) => return Transfer::Skipped,
            Some(Ordering::Equal) if have_file => {
                return if local.version == incoming.version {
                    Transfer::Skipped
                } else {
                    Transfer::Updated
                };
            }
            _ => {}
        }
    }

    let source = cache_file_for(root, path);
    if !fs::try_exists(&source).await.unwrap_or(false) {
        error!("File {} missing in source", path);
        return Transfer::Errored;
    }

    match atomic_copy(&source, &target).await {
        Ok(_) => Transfer::Copied,
        Err(e) => {
            error!("Failed to copy {}: {}", path, e);
            Transfer::Errored
        }
    }
}
