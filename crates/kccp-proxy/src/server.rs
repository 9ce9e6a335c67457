//! Server state management and orchestration.
//!
//! The cache engine, the optional patch pipeline and the counters are built
//! once at startup and shared by every connection through [`AppState`].

use crate::{
    config::ProxyConfig,
    error::{ConfigError, ServerError},
    route::RequestRouter,
};
use kccp_cache::{AssetTransform, CacheEngine, CacheStats, IndexSummary};
use kccp_patch::{PatchPipeline, PatchTable, load_descriptors};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared application state for request handlers.
#[derive(Debug)]
pub struct AppState {
    config: ProxyConfig,
    engine: Arc<CacheEngine>,
    pipeline: Option<Arc<PatchPipeline>>,
    router: RequestRouter,
}

impl AppState {
    /// Create application state from configuration.
    ///
    /// Opens the cache, loads persisted counters and, with the modder
    /// enabled, scans the configured mod packs.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the cache cannot be opened or the mods file
    /// cannot be read.
    pub async fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let stats = match &config.stats_file {
            Some(path) => CacheStats::load(path).await,
            None => CacheStats::new(),
        };

        let mut engine = CacheEngine::open(config.cache_config())
            .await?
            .with_stats(Arc::new(stats));

        let pipeline = if config.enable_modder {
            let pipeline = Arc::new(open_pipeline(&config).await?);
            engine = engine.with_transform(Arc::clone(&pipeline) as Arc<dyn AssetTransform>);
            Some(pipeline)
        } else {
            None
        };

        let router = RequestRouter::new(&config.origin, config.alias_domain.clone(), config.bind)
            .map_err(|e| ConfigError::InvalidValue {
                option: "origin",
                reason: e.to_string(),
            })?;

        let engine = Arc::new(engine);
        let summary = IndexSummary::from_index(engine.index());
        info!(
            "Cache has {} files, {} bytes{}",
            summary.cached_files,
            summary.cached_size,
            if summary.old_cache {
                " (some entries predate length tracking)"
            } else {
                ""
            }
        );

        Ok(Self {
            config,
            engine,
            pipeline,
            router,
        })
    }

    /// Proxy configuration
    pub const fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The cache engine
    pub const fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    /// The patch pipeline, when the modder is enabled
    pub const fn pipeline(&self) -> Option<&Arc<PatchPipeline>> {
        self.pipeline.as_ref()
    }

    /// Request counters
    pub fn stats(&self) -> &Arc<CacheStats> {
        self.engine.stats()
    }

    /// HTTP client shared with the cache engine
    pub fn client(&self) -> &reqwest::Client {
        self.engine.client()
    }

    /// Request resolver
    pub const fn router(&self) -> &RequestRouter {
        &self.router
    }

    /// Rescan the mod packs listed in the mods file and swap in the new table.
    ///
    /// Returns `None` when the modder is disabled. Requests already being
    /// patched finish with the previous table.
    pub async fn reload_mods(&self) -> Result<Option<Arc<PatchTable>>, ServerError> {
        let Some(pipeline) = &self.pipeline else {
            return Ok(None);
        };
        let mods = self
            .config
            .mods
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("--mods".to_string()))?;
        let descriptors = load_descriptors(mods).await?;
        Ok(Some(pipeline.reload(&descriptors).await?))
    }

    /// Persist the cache index, the patched index and the counters.
    ///
    /// Every store is attempted; the first failure is returned.
    pub async fn flush(&self) -> Result<(), ServerError> {
        let mut result = Ok(());

        if let Err(e) = self.engine.flush().await {
            error!("Failed to save cache index: {e}");
            result = Err(e.into());
        }
        if let Some(pipeline) = &self.pipeline
            && let Err(e) = pipeline.flush().await
        {
            error!("Failed to save patched index: {e}");
            if result.is_ok() {
                result = Err(e.into());
            }
        }
        if let Some(path) = &self.config.stats_file
            && let Err(e) = self.stats().save(path).await
        {
            error!("Failed to save stats: {e}");
            if result.is_ok() {
                result = Err(e.into());
            }
        }

        result
    }
}

/// Open the patch pipeline and load the packs listed in the mods file.
pub async fn open_pipeline(config: &ProxyConfig) -> Result<PatchPipeline, ServerError> {
    let pipeline = PatchPipeline::open(config.pipeline_config()).await?;
    if let Some(mods) = &config.mods {
        let descriptors = load_descriptors(mods).await?;
        pipeline.reload(&descriptors).await?;
    }
    Ok(pipeline)
}

/// Server orchestration.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Create new server with configuration.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the shared state cannot be built.
    pub async fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let state = AppState::new(config).await?;
        info!(
            "Server initialized for origin {} with cache at {}",
            state.config().origin,
            state.config().cache_dir.display()
        );
        Ok(Self {
            state: Arc::new(state),
        })
    }

    /// Run the proxy until interrupted.
    ///
    /// On Ctrl-C the listener stops accepting, open requests finish, and all
    /// pending index and counter writes are flushed.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the final flush fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let bind = self.state.config().bind;
        info!("Starting proxy on {}", bind);
        let listener = crate::http::bind(bind).await?;

        let reloader = spawn_reload_on_hangup(Arc::clone(&self.state));
        let served =
            crate::http::serve(listener, Arc::clone(&self.state), shutdown_signal()).await;
        if let Some(reloader) = reloader {
            reloader.abort();
        }
        served?;

        info!("KCCacheProxy shutting down.");
        self.state.flush().await
    }

    /// Shared application state
    pub const fn state(&self) -> &Arc<AppState> {
        &self.state
    }
}

/// Rescan the mod packs on every `SIGHUP`.
#[cfg(unix)]
fn spawn_reload_on_hangup(state: Arc<AppState>) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    state.pipeline()?;
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Failed to listen for SIGHUP, mods will not reload: {e}");
            return None;
        }
    };
    info!("Send SIGHUP to reload mods");

    Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading mods");
            match state.reload_mods().await {
                Ok(Some(table)) => info!(
                    "Reloaded {} rules for {} targets from {} packs",
                    table.len(),
                    table.target_count(),
                    table.pack_count()
                ),
                Ok(None) => {}
                Err(e) => error!("Failed to reload mods: {e}"),
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_state: Arc<AppState>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping server"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }
}
