//! Export the part of the local cache that differs from a baseline index.
//!
//! The package holds a trimmed `cached.json` plus the files whose content
//! changed, laid out by canonical path, so it can be merged into a cache that
//! matches the baseline.

use crate::{
    config::INDEX_FILE_NAME,
    error::{CacheError, CacheResult},
    index::IndexStore,
    location::cache_file_for,
    merge::{Transfer, TransferReport, compare_lastmodified, read_foreign_index},
    persist::temp_path,
    record::CacheRecord,
};
use flate2::{Compression, write::GzEncoder};
use futures::stream::{self, StreamExt};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::{error, info};

fn classify(local: &CacheRecord, baseline: Option<&CacheRecord>) -> Transfer {
    match baseline {
        Some(base)
            if compare_lastmodified(
                local.lastmodified.as_deref(),
                base.lastmodified.as_deref(),
            ) == Some(Ordering::Equal)
                && local.length == base.length =>
        {
            if local.version == base.version {
                Transfer::Skipped
            } else {
                Transfer::Updated
            }
        }
        _ => Transfer::Copied,
    }
}

/// Write a package of everything in `index` that changed relative to the
/// index document at `baseline`.
pub async fn diff_cache(
    index: &Arc<IndexStore<CacheRecord>>,
    cache_dir: &Path,
    baseline: &Path,
    output: &Path,
    fan_out: usize,
) -> CacheResult<TransferReport> {
    let baseline = read_foreign_index(baseline).await?;
    let entries = index.snapshot();
    info!(
        "Comparing {} local entries against a baseline of {}",
        entries.len(),
        baseline.len()
    );

    let baseline = &baseline;
    let results: Vec<(String, CacheRecord, Transfer)> = stream::iter(entries)
        .map(|(path, record)| async move {
            let mut transfer = classify(&record, baseline.get(&path));
            if transfer == Transfer::Copied
                && !fs::try_exists(cache_file_for(cache_dir, &path))
                    .await
                    .unwrap_or(false)
            {
                error!("File {} missing in cache", path);
                transfer = Transfer::Errored;
            }
            (path, record, transfer)
        })
        .buffer_unordered(fan_out)
        .collect()
        .await;

    let mut report = TransferReport::default();
    let mut trimmed = BTreeMap::new();
    let mut files = Vec::new();
    for (path, record, transfer) in results {
        report.count(transfer);
        match transfer {
            Transfer::Copied => {
                files.push(path.clone());
                trimmed.insert(path, record);
            }
            Transfer::Updated => {
                trimmed.insert(path, record);
            }
            Transfer::Skipped | Transfer::Errored => {}
        }
    }
    files.sort();

    let cache_dir = cache_dir.to_path_buf();
    let output_path = output.to_path_buf();
    tokio::task::spawn_blocking(move || write_package(&output_path, &cache_dir, &trimmed, &files))
        .await?
        .map_err(|e| CacheError::Archive(format!("{}: {}", output.display(), e)))?;

    info!(
        "Wrote {}: {} copied, {} updated, {} unchanged, {} failed",
        output.display(),
        report.copied,
        report.updated,
        report.skipped,
        report.errored
    );
    Ok(report)
}

fn write_package(
    output: &Path,
    cache_dir: &Path,
    index: &BTreeMap<String, CacheRecord>,
    files: &[String],
) -> std::io::Result<()> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let tmp: PathBuf = temp_path(output);
    let file = std::fs::File::create(&tmp)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let document = serde_json::to_vec(index)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(document.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, INDEX_FILE_NAME, document.as_slice())?;

    for path in files {
        builder.append_path_with_name(
            cache_file_for(cache_dir, path),
            path.trim_start_matches('/'),
        )?;
    }

    let file = builder.into_inner()?.finish()?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, lastmodified: &str, length: u64) -> CacheRecord {
        CacheRecord {
            version: version.to_string(),
            lastmodified: Some(lastmodified.to_string()),
            length: Some(length),
            cache: None,
        }
    }

    #[test]
    fn test_classify() {
        let jan = "Mon, 01 Jan 2024 00:00:00 GMT";
        let feb = "Thu, 01 Feb 2024 00:00:00 GMT";
        let local = record("?v2", feb, 10);

        assert_eq!(classify(&local, None), Transfer::Copied);
        assert_eq!(classify(&local, Some(&record("?v1", jan, 10))), Transfer::Copied);
        assert_eq!(classify(&local, Some(&record("?v1", feb, 9))), Transfer::Copied);
        assert_eq!(classify(&local, Some(&record("?v1", feb, 10))), Transfer::Updated);
        assert_eq!(classify(&local, Some(&record("?v2", feb, 10))), Transfer::Skipped);
    }
}
