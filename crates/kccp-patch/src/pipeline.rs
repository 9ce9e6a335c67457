//! Patch pipeline applied to assets on their way out of the cache.

use crate::{
    error::{PatchError, PatchResult},
    manifest::{ModDescriptor, ModPack},
    patched_cache::PatchedCache,
    rules::{PatchTable, ResolvedPatches},
    scan::scan_packs,
    sprite::{SheetOutcome, apply_rules, load_frames},
};
use async_trait::async_trait;
use bytes::Bytes;
use image::ImageFormat;
use kccp_cache::{AssetLocation, AssetTransform, CacheRecord};
use parking_lot::RwLock;
use std::{
    io::Cursor,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

/// Default limit for one patcher script invocation
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`PatchPipeline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Cache root; the derived cache lives inside it
    pub cache_dir: PathBuf,
    /// Limit for one patcher script invocation
    pub script_timeout: Duration,
    /// Delay between the last patched-index mutation and the save
    pub save_debounce: Duration,
    /// Pending mutation count that stops deferring the save
    pub save_backpressure: usize,
}

impl PipelineConfig {
    /// Create a configuration for the cache at `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
            save_debounce: kccp_cache::config::DEFAULT_SAVE_DEBOUNCE,
            save_backpressure: kccp_cache::config::DEFAULT_SAVE_BACKPRESSURE,
        }
    }

    /// Set the script timeout
    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    /// Set the patched-index save schedule
    pub fn with_save_schedule(mut self, debounce: Duration, backpressure: usize) -> Self {
        self.save_debounce = debounce;
        self.save_backpressure = backpressure;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> PatchResult<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(PatchError::Config("cache_dir must not be empty".to_string()));
        }
        if self.script_timeout.is_zero() {
            return Err(PatchError::Config(
                "script_timeout must be greater than 0".to_string(),
            ));
        }
        if self.save_backpressure == 0 {
            return Err(PatchError::Config(
                "save_backpressure must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Applies the loaded packs to served assets
#[derive(Debug)]
pub struct PatchPipeline {
    config: PipelineConfig,
    table: RwLock<Arc<PatchTable>>,
    cache: PatchedCache,
    repatched: AtomicU64,
}

impl PatchPipeline {
    /// Open the pipeline with an empty table.
    pub async fn open(config: PipelineConfig) -> PatchResult<Self> {
        config.validate()?;
        let cache = PatchedCache::open(
            &config.cache_dir,
            config.save_debounce,
            config.save_backpressure,
        )
        .await;
        Ok(Self {
            config,
            table: RwLock::new(Arc::new(PatchTable::new())),
            cache,
            repatched: AtomicU64::new(0),
        })
    }

    /// Rebuild the table from `mods` and swap it in.
    ///
    /// Packs that fail to load are logged and left out. Requests already
    /// being patched keep the previous table.
    pub async fn reload(&self, mods: &[ModDescriptor]) -> PatchResult<Arc<PatchTable>> {
        let started = Instant::now();
        let mut packs = Vec::with_capacity(mods.len());
        let mut skipped = 0;
        for descriptor in mods {
            match ModPack::load(descriptor).await {
                Ok(pack) => packs.push(pack),
                Err(e) => {
                    error!("Skipping mod {}: {}", descriptor.path.display(), e);
                    skipped += 1;
                }
            }
        }

        let timeout = self.config.script_timeout;
        let mut table = tokio::task::spawn_blocking(move || scan_packs(&packs, timeout)).await?;
        for _ in 0..skipped {
            table.add_error();
        }

        let table = Arc::new(table);
        *self.table.write() = Arc::clone(&table);
        info!(
            "Preparing mod images took {:?}: {} rules for {} targets from {} packs",
            started.elapsed(),
            table.len(),
            table.target_count(),
            table.pack_count()
        );
        Ok(table)
    }

    /// The active table
    pub fn table(&self) -> Arc<PatchTable> {
        Arc::clone(&self.table.read())
    }

    /// The derived cache
    pub fn patched_cache(&self) -> &PatchedCache {
        &self.cache
    }

    /// Number of times an image had to be recomputed
    pub fn repatched(&self) -> u64 {
        self.repatched.load(Ordering::Relaxed)
    }

    /// Save the patched index now.
    pub async fn flush(&self) -> PatchResult<()> {
        self.cache.flush().await
    }

    /// Patch `body`, the current content of `asset`.
    pub async fn apply(
        &self,
        asset: &AssetLocation,
        record: Option<&CacheRecord>,
        body: Bytes,
    ) -> PatchResult<Bytes> {
        let table = self.table();
        if table.is_empty() {
            return Ok(body);
        }
        let resolved = table.resolve(&asset.path);
        if resolved.is_empty() {
            return Ok(body);
        }

        for script in &resolved.scripts {
            if let Some(replacement) = script.transform(&asset.path, &body).await {
                debug!("Script {:?} rewrote {}", script, asset.path);
                return Ok(replacement);
            }
        }

        let is_png = asset.extension().as_deref() == Some("png");
        if is_png && !resolved.images.is_empty() {
            let lastmodified = record.and_then(|r| r.lastmodified.as_deref());
            return self.patch_image(asset, lastmodified, &resolved, body).await;
        }

        Ok(resolved
            .bytes
            .iter()
            .find(|rule| rule.original == body)
            .map_or(body, |rule| {
                debug!("Replacing {} with {}", asset.path, rule.name);
                rule.patched.clone()
            }))
    }

    async fn patch_image(
        &self,
        asset: &AssetLocation,
        lastmodified: Option<&str>,
        resolved: &ResolvedPatches,
        body: Bytes,
    ) -> PatchResult<Bytes> {
        let stamp = source_stamp(lastmodified, &body);
        if let Some(cached) = self
            .cache
            .get(&asset.path, &resolved.patch_hash, Some(&stamp))
            .await
        {
            return Ok(cached);
        }

        info!("Need to repatch {}", asset.path);
        self.repatched.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let frames = match load_frames(&asset.cache_file).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!("{}, treating {} as a single sprite", e, asset.path);
                None
            }
        };

        let rules = resolved.images.clone();
        let source = body.clone();
        let output = tokio::task::spawn_blocking(move || -> PatchResult<Bytes> {
            let sheet = image::load_from_memory_with_format(&source, ImageFormat::Png)?.to_rgba8();
            Ok(match apply_rules(sheet, frames.as_deref(), &rules) {
                SheetOutcome::Unchanged => source,
                SheetOutcome::Replaced(bytes) => bytes,
                SheetOutcome::Composited { image, replaced } => {
                    debug!("Replaced {} frames", replaced);
                    let mut encoded = Cursor::new(Vec::new());
                    image.write_to(&mut encoded, ImageFormat::Png)?;
                    Bytes::from(encoded.into_inner())
                }
            })
        })
        .await??;

        if let Err(e) = self
            .cache
            .put(&asset.path, &output, &resolved.patch_hash, Some(&stamp))
            .await
        {
            error!("Failed to store patched {}: {}", asset.path, e);
        }
        info!("Patching {} took {:?}", asset.path, started.elapsed());
        Ok(output)
    }
}

/// Identity of the source a patched copy was computed from.
///
/// Without a `Last-Modified` the source bytes themselves stand in for it, so
/// changed art still invalidates the derived copy.
fn source_stamp(lastmodified: Option<&str>, body: &[u8]) -> String {
    lastmodified.map_or_else(
        || format!("md5:{:x}", md5::compute(body)),
        ToString::to_string,
    )
}

#[async_trait]
impl AssetTransform for PatchPipeline {
    async fn transform(
        &self,
        asset: &AssetLocation,
        record: Option<&CacheRecord>,
        body: Bytes,
    ) -> Bytes {
        match self.apply(asset, record, body.clone()).await {
            Ok(patched) => patched,
            Err(e) => {
                error!("Failed to patch {}: {}", asset.path, e);
                body
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_source_stamp() {
        assert_eq!(source_stamp(Some("Mon"), b"a"), "Mon");
        assert_ne!(source_stamp(None, b"a"), source_stamp(None, b"b"));
        assert_eq!(source_stamp(None, b"a"), source_stamp(None, b"a"));
    }

    #[test]
    fn test_config_validate() {
        assert!(PipelineConfig::new("/cache").validate().is_ok());
        assert!(PipelineConfig::new("").validate().is_err());
        assert!(
            PipelineConfig::new("/cache")
                .with_script_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_empty_table_passes_through() {
        let dir = TempDir::new().unwrap();
        let pipeline = PatchPipeline::open(PipelineConfig::new(dir.path())).await.unwrap();
        let asset =
            AssetLocation::parse("http://127.0.0.1/kcs2/img/a.png?v1", dir.path()).unwrap();

        let body = Bytes::from_static(b"not even a png");
        let out = pipeline.apply(&asset, None, body.clone()).await.unwrap();
        assert_eq!(out, body);
        assert_eq!(pipeline.repatched(), 0);
    }

    #[tokio::test]
    async fn test_reload_skips_broken_descriptors() {
        let dir = TempDir::new().unwrap();
        let pipeline = PatchPipeline::open(PipelineConfig::new(dir.path())).await.unwrap();
        let table = pipeline
            .reload(&[ModDescriptor::new(dir.path().join("absent.mod.json"))])
            .await
            .unwrap();
        assert!(table.is_empty());
        assert_eq!(table.error_count(), 1);
        assert_eq!(table.pack_count(), 0);
    }
}
