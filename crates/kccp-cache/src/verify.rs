//! On-demand integrity sweep over the cache index.

use crate::{
    error::CacheResult,
    index::IndexStore,
    location::cache_file_for,
    persist::remove_if_exists,
    record::CacheRecord,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::{path::Path, sync::Arc};
use tokio::fs;
use tracing::{error, info, warn};

/// Outcome counts of a verification sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Entries in the index
    pub total: usize,
    /// Entries whose file was compared
    pub checked: usize,
    /// Entries whose file length differs from the record
    pub invalid: usize,
    /// Entries whose file could not be inspected (usually missing)
    pub errored: usize,
    /// Legacy entries without a recorded length
    pub unchecked: usize,
}

enum Check {
    Valid,
    Invalid,
    Errored,
    Unchecked,
}

/// Compare every recorded length with the file on disk.
///
/// With `delete`, mismatching files are removed together with their records
/// and the index is saved.
pub async fn verify_cache(
    index: &Arc<IndexStore<CacheRecord>>,
    cache_dir: &Path,
    fan_out: usize,
    delete: bool,
) -> CacheResult<VerifyReport> {
    info!("Verifying cache... This might take a while");

    let entries = index.snapshot();
    let total = entries.len();

    let checks: Vec<(String, Check)> = stream::iter(entries)
        .map(|(path, record)| async move {
            let Some(expected) = record.length else {
                return (path, Check::Unchecked);
            };
            let file = cache_file_for(cache_dir, &path);
            let check = match fs::metadata(&file).await {
                Ok(meta) if meta.len() == expected => Check::Valid,
                Ok(meta) => {
                    error!(
                        "{} length doesn't match! {} != {}",
                        path,
                        meta.len(),
                        expected
                    );
                    if delete
                        && let Err(e) = remove_if_exists(&file).await
                    {
                        warn!("Failed to delete {}: {}", file.display(), e);
                    }
                    Check::Invalid
                }
                Err(_) => Check::Errored,
            };
            (path, check)
        })
        .buffer_unordered(fan_out)
        .collect()
        .await;

    let mut report = VerifyReport {
        total,
        ..VerifyReport::default()
    };
    for (path, check) in &checks {
        match check {
            Check::Valid => report.checked += 1,
            Check::Invalid => {
                report.checked += 1;
                report.invalid += 1;
                if delete {
                    index.remove(path);
                }
            }
            Check::Errored => report.errored += 1,
            Check::Unchecked => report.unchecked += 1,
        }
    }

    if delete && report.invalid > 0 {
        index.flush().await?;
    }

    info!(
        "Done verifying, found {} invalid files, {} files checked, cached.json contains {} files, failed to check {} files (missing?)",
        report.invalid, report.checked, report.total, report.errored
    );
    Ok(report)
}
