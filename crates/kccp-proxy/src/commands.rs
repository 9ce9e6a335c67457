//! Maintenance operations run instead of the proxy.
//!
//! Each command opens the cache on its own; none of them should run while a
//! proxy is serving the same cache directory.

use crate::{
    config::ProxyConfig,
    error::{ConfigError, ServerError},
    server::open_pipeline,
};
use kccp_cache::{CacheEngine, TransferReport, VerifyReport};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Rule counts of a freshly scanned mod set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModReport {
    /// Packs scanned
    pub packs: usize,
    /// Rules loaded
    pub rules: usize,
    /// Canonical path prefixes with at least one rule
    pub targets: usize,
    /// Packs or rules skipped because of errors
    pub errors: usize,
}

/// Check every recorded file length.
///
/// # Errors
///
/// Returns `ConfigError::Disabled` unless `--verify-cache` is set, or the
/// cache error that stopped the sweep.
pub async fn verify_cache(config: &ProxyConfig, delete: bool) -> Result<VerifyReport, ServerError> {
    if !config.verify_cache {
        return Err(ConfigError::Disabled(
            "Cache verification is disabled, enable it with --verify-cache".to_string(),
        )
        .into());
    }
    let engine = CacheEngine::open(config.cache_config()).await?;
    let report = engine.verify(delete).await?;
    info!("Verified cache: {:?}", report);
    Ok(report)
}

/// Import another cache directory or package.
///
/// # Errors
///
/// Returns `ServerError` if either cache cannot be read or the merged index
/// cannot be saved.
pub async fn merge(config: &ProxyConfig, source: &Path) -> Result<TransferReport, ServerError> {
    let engine = CacheEngine::open(config.cache_config()).await?;
    let report = engine.merge(source).await?;
    info!("Merged {}: {:?}", source.display(), report);
    Ok(report)
}

/// Package the entries that changed since `baseline`.
///
/// # Errors
///
/// Returns `ServerError` if the baseline cannot be read or the package
/// cannot be written.
pub async fn diff(
    config: &ProxyConfig,
    baseline: &Path,
    output: &Path,
) -> Result<TransferReport, ServerError> {
    let engine = CacheEngine::open(config.cache_config()).await?;
    let report = engine.diff(baseline, output).await?;
    info!("Wrote {}: {:?}", output.display(), report);
    Ok(report)
}

/// Scan the configured mod packs and report what they contain.
///
/// # Errors
///
/// Returns `ServerError` if the mods file cannot be read.
pub async fn check_mods(config: &ProxyConfig) -> Result<ModReport, ServerError> {
    let pipeline = open_pipeline(config).await?;
    let table = pipeline.table();
    Ok(ModReport {
        packs: table.pack_count(),
        rules: table.len(),
        targets: table.target_count(),
        errors: table.error_count(),
    })
}
