//! Conditional-fetch cache engine
//!
//! Requests for the same canonical path share one upstream fetch. The fetch
//! runs in its own task so it completes and persists even when every waiting
//! client disconnects.

use crate::{
    config::CacheConfig,
    diff::diff_cache,
    error::{CacheError, CacheResult},
    index::IndexStore,
    location::{AssetLocation, content_type_for},
    merge::{TransferReport, merge_cache},
    origin::{build_client, forwardable_headers, is_hop_by_hop},
    persist::atomic_write,
    record::CacheRecord,
    stats::{CacheStats, Stat},
    transform::AssetTransform,
    verify::{VerifyReport, verify_cache},
};
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{
    StatusCode,
    header::{self, HeaderMap, HeaderName, HeaderValue},
};
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Body sent when the origin failed and nothing was cached
pub const GATEWAY_FAILURE: &str =
    "The caching proxy was unable to handle your request and no cached version was available";

const IMMUTABLE: &str = "max-age=2592000, public, immutable";

/// Where a response body came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Fresh hit served from disk without contacting the origin
    Disk,
    /// Downloaded from the origin and stored
    Origin,
    /// Origin answered 304, stored copy served
    Revalidated,
    /// Origin failed, stale copy served
    Stale,
    /// Origin response relayed without caching
    Upstream,
    /// Nothing to serve
    Failed,
}

/// A cache-eligible request
#[derive(Debug, Clone)]
pub struct AssetRequest {
    /// Absolute URL of the asset
    pub url: String,
    /// Client request headers
    pub headers: HeaderMap,
}

impl AssetRequest {
    /// Request `url` without client headers
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Attach client headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Response produced by the engine
#[derive(Debug, Clone)]
pub struct CacheResponse {
    /// Status sent to the client
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body, after any transform
    pub body: Bytes,
    /// Where the body came from
    pub source: ResponseSource,
}

impl CacheResponse {
    fn text(status: StatusCode, message: impl Into<String>, source: ResponseSource) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        Self {
            status,
            headers,
            body: Bytes::from(message.into()),
            source,
        }
    }
}

#[derive(Debug, Clone)]
enum FetchOutcome {
    Content {
        body: Bytes,
        source: ResponseSource,
    },
    Upstream {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Failed {
        status: StatusCode,
        message: String,
    },
}

impl FetchOutcome {
    fn gateway_failure() -> Self {
        Self::Failed {
            status: StatusCode::BAD_GATEWAY,
            message: GATEWAY_FAILURE.to_string(),
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Caching front for one origin and one cache directory
pub struct CacheEngine {
    config: CacheConfig,
    index: Arc<IndexStore<CacheRecord>>,
    stats: Arc<CacheStats>,
    client: reqwest::Client,
    in_flight: DashMap<String, SharedFetch>,
    transform: Option<Arc<dyn AssetTransform>>,
    origin_compromised: AtomicBool,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("cache_dir", &self.config.cache_dir)
            .field("entries", &self.index.len())
            .field("in_flight", &self.in_flight.len())
            .field("has_transform", &self.transform.is_some())
            .finish_non_exhaustive()
    }
}

impl CacheEngine {
    /// Open the cache described by `config`, loading its index.
    pub async fn open(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.cache_dir).await?;

        let client = build_client(config.upstream_timeout)?;
        let index = IndexStore::load(config.index_path())
            .await
            .with_schedule(config.save_debounce, config.save_backpressure);
        info!(
            "Cache engine ready at {} with {} entries",
            config.cache_dir.display(),
            index.len()
        );

        Ok(Self {
            config,
            index: Arc::new(index),
            stats: Arc::new(CacheStats::new()),
            client,
            in_flight: DashMap::new(),
            transform: None,
            origin_compromised: AtomicBool::new(false),
        })
    }

    /// Share an existing set of counters
    pub fn with_stats(mut self, stats: Arc<CacheStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Rewrite served bodies through `transform`
    pub fn with_transform(mut self, transform: Arc<dyn AssetTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Engine configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The cache index
    pub fn index(&self) -> &Arc<IndexStore<CacheRecord>> {
        &self.index
    }

    /// Shared counters
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// HTTP client used for origin requests
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Whether any fallback has been served since startup
    pub fn is_origin_compromised(&self) -> bool {
        self.origin_compromised.load(Ordering::Acquire)
    }

    /// Whether `path` is a version-critical file that must be refetched
    pub fn is_invalidated(&self, path: &str) -> bool {
        self.is_origin_compromised() && self.config.is_invalidatable(path)
    }

    fn mark_origin_compromised(&self) {
        if !self.origin_compromised.swap(true, Ordering::AcqRel) {
            warn!("Origin unreliable, version-critical files will be refetched");
        }
    }

    /// Save the index immediately
    pub async fn flush(&self) -> CacheResult<()> {
        self.index.flush().await
    }

    /// Check every recorded length against the file on disk
    pub async fn verify(&self, delete: bool) -> CacheResult<VerifyReport> {
        verify_cache(&self.index, &self.config.cache_dir, self.config.fan_out, delete).await
    }

    /// Import a foreign cache directory or package
    pub async fn merge(&self, source: &Path) -> CacheResult<TransferReport> {
        merge_cache(&self.index, &self.config.cache_dir, source, self.config.fan_out).await
    }

    /// Package the entries that changed relative to `baseline`
    pub async fn diff(&self, baseline: &Path, output: &Path) -> CacheResult<TransferReport> {
        diff_cache(
            &self.index,
            &self.config.cache_dir,
            baseline,
            output,
            self.config.fan_out,
        )
        .await
    }

    /// Serve a cache-eligible request.
    pub async fn handle(self: &Arc<Self>, request: &AssetRequest) -> CacheResponse {
        let location = match AssetLocation::parse(&request.url, &self.config.cache_dir) {
            Ok(location) => location,
            Err(e) => {
                warn!("{}", e);
                return CacheResponse::text(
                    StatusCode::BAD_REQUEST,
                    e.to_string(),
                    ResponseSource::Failed,
                );
            }
        };

        let mut force = false;
        let prior = loop {
            let prior = if force {
                None
            } else {
                self.prior_copy(&location).await
            };

            let Some(record) = prior.as_ref().filter(|r| self.is_fresh(&location, r)) else {
                break prior;
            };

            let contents = match fs::read(&location.cache_file).await {
                Ok(contents) => Bytes::from(contents),
                Err(e) => {
                    warn!("Failed to read {}: {}", location.cache_file.display(), e);
                    force = true;
                    continue;
                }
            };

            self.stats.record(Stat::InCache);
            self.stats.add_bandwidth_saved(contents.len() as i64);

            if self.config.verify_cache
                && let Some(expected) = record.length
                && expected != contents.len() as u64
            {
                let err = CacheError::Corruption {
                    path: location.path.clone(),
                    expected,
                    actual: contents.len() as u64,
                };
                error!("{}", err);
                self.stats.add_bandwidth_saved(-(contents.len() as i64));
                force = true;
                continue;
            }

            debug!("Serving {} from cache", location.path);
            return self
                .respond(&location, contents, ResponseSource::Disk)
                .await;
        };

        let outcome = self
            .fetch_shared(&location, prior, forwardable_headers(&request.headers))
            .await;
        self.finish(&location, outcome).await
    }

    async fn prior_copy(&self, location: &AssetLocation) -> Option<CacheRecord> {
        let record = self.index.get(&location.path)?;
        match fs::try_exists(&location.cache_file).await {
            Ok(true) => Some(record),
            _ => None,
        }
    }

    fn is_fresh(&self, location: &AssetLocation, record: &CacheRecord) -> bool {
        record.version_matches(&location.version)
            && !self.config.is_no_cache(&location.path)
            && !self.is_invalidated(&location.path)
    }

    /// Join the in-flight fetch for this path, or start one.
    fn fetch_shared(
        self: &Arc<Self>,
        location: &AssetLocation,
        prior: Option<CacheRecord>,
        headers: HeaderMap,
    ) -> SharedFetch {
        match self.in_flight.entry(location.path.clone()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight fetch of {}", location.path);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let engine = Arc::clone(self);
                let task_location = location.clone();
                let handle = tokio::spawn(async move {
                    let outcome = engine
                        .conditional_fetch(&task_location, prior, headers)
                        .await;
                    engine.in_flight.remove(&task_location.path);
                    outcome
                });

                let path = location.path.clone();
                let fetch = async move {
                    handle.await.unwrap_or_else(|e| {
                        error!("Fetch task for {} failed: {}", path, e);
                        FetchOutcome::gateway_failure()
                    })
                }
                .boxed()
                .shared();

                entry.insert(fetch.clone());
                fetch
            }
        }
    }

    async fn conditional_fetch(
        &self,
        location: &AssetLocation,
        prior: Option<CacheRecord>,
        headers: HeaderMap,
    ) -> FetchOutcome {
        info!("Loading {}", location.path);
        let has_prior = prior.is_some();

        let mut request = self.client.get(location.url.clone()).headers(headers);
        if let Some(lastmodified) = prior.as_ref().and_then(|r| r.lastmodified.as_deref()) {
            request = request.header(header::IF_MODIFIED_SINCE, lastmodified);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return self.network_failure(location, has_prior, e.into()).await,
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return self.not_modified(location, has_prior).await;
        }

        if status.is_client_error() || status.is_server_error() {
            if has_prior {
                if status == StatusCode::FORBIDDEN {
                    info!("HTTP 403: Forbidden, using cached data for {}", location.path);
                } else {
                    warn!("HTTP {} for {}, using cached data", status, location.path);
                }
                self.stats.record(Stat::Blocked);
                self.mark_origin_compromised();
                return self.read_stale(location).await;
            }

            warn!("HTTP error {} for {}", status, location.url);
            self.stats.record(Stat::Failed);
            return relay(location, response).await;
        }

        if !status.is_success() {
            debug!("Relaying HTTP {} for {} uncached", status, location.url);
            return relay(location, response).await;
        }

        let lastmodified = header_string(response.headers(), &header::LAST_MODIFIED);
        let cache = header_string(response.headers(), &header::CACHE_CONTROL);
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return self.network_failure(location, has_prior, e.into()).await,
        };
        self.stats.record(Stat::Fetched);

        let record = CacheRecord {
            version: location.version.clone(),
            lastmodified,
            length: Some(body.len() as u64),
            cache,
        };
        self.persist(location, &body, record).await;

        FetchOutcome::Content {
            body,
            source: ResponseSource::Origin,
        }
    }

    async fn persist(&self, location: &AssetLocation, body: &[u8], record: CacheRecord) {
        match atomic_write(&location.cache_file, body).await {
            Ok(()) => {
                self.index.insert(location.path.clone(), record);
                self.index.queue_save();
                info!("Saved {}", location.url);
            }
            Err(e) => error!(
                "Failed to persist {}: {}",
                location.cache_file.display(),
                e
            ),
        }
    }

    async fn not_modified(&self, location: &AssetLocation, has_prior: bool) -> FetchOutcome {
        if !has_prior {
            let err = CacheError::NotModifiedWithoutCopy {
                path: location.path.clone(),
            };
            error!("{}", err);
            self.stats.record(Stat::Failed);
            return FetchOutcome::gateway_failure();
        }

        info!("Not modified {}", location.path);
        self.stats.record(Stat::NotModified);
        self.index.update(&location.path, |record| {
            record.version.clone_from(&location.version);
        });
        self.index.queue_save();

        match fs::read(&location.cache_file).await {
            Ok(contents) => FetchOutcome::Content {
                body: Bytes::from(contents),
                source: ResponseSource::Revalidated,
            },
            Err(e) => {
                error!("Cached copy of {} vanished: {}", location.path, e);
                FetchOutcome::gateway_failure()
            }
        }
    }

    async fn network_failure(
        &self,
        location: &AssetLocation,
        has_prior: bool,
        err: CacheError,
    ) -> FetchOutcome {
        if has_prior {
            error!("Fetch failed, using cached version of {}: {}", location.path, err);
            self.stats.record(Stat::Blocked);
            self.mark_origin_compromised();
            self.read_stale(location).await
        } else {
            error!("Fetch failed, no cached version of {}: {}", location.path, err);
            self.stats.record(Stat::Failed);
            FetchOutcome::gateway_failure()
        }
    }

    async fn read_stale(&self, location: &AssetLocation) -> FetchOutcome {
        match fs::read(&location.cache_file).await {
            Ok(contents) => FetchOutcome::Content {
                body: Bytes::from(contents),
                source: ResponseSource::Stale,
            },
            Err(e) => {
                error!("Stale copy of {} unreadable: {}", location.path, e);
                FetchOutcome::gateway_failure()
            }
        }
    }

    async fn finish(&self, location: &AssetLocation, outcome: FetchOutcome) -> CacheResponse {
        match outcome {
            FetchOutcome::Content { body, source } => {
                if source != ResponseSource::Origin {
                    self.stats.add_bandwidth_saved(body.len() as i64);
                }
                self.respond(location, body, source).await
            }
            FetchOutcome::Upstream {
                status,
                headers,
                body,
            } => CacheResponse {
                status,
                headers,
                body,
                source: ResponseSource::Upstream,
            },
            FetchOutcome::Failed { status, message } => {
                CacheResponse::text(status, message, ResponseSource::Failed)
            }
        }
    }

    async fn respond(
        &self,
        location: &AssetLocation,
        body: Bytes,
        source: ResponseSource,
    ) -> CacheResponse {
        let record = self.index.get(&location.path);
        let body = match &self.transform {
            Some(transform) => transform.transform(location, record.as_ref(), body).await,
            None => body,
        };

        CacheResponse {
            status: StatusCode::OK,
            headers: self.response_headers(&location.path, record.as_ref()),
            body,
            source,
        }
    }

    /// Headers sent with a cached body
    pub fn response_headers(&self, path: &str, record: Option<&CacheRecord>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::SERVER, HeaderValue::from_static("nginx"));

        if self.config.is_no_cache(path) {
            let directive = match record {
                Some(record) if !record.forbids_browser_cache() => IMMUTABLE,
                _ => "no-store",
            };
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(directive));
        } else {
            headers.insert(
                HeaderName::from_static("x-dns-prefetch-control"),
                HeaderValue::from_static("off"),
            );
            if self.config.disable_browser_cache || self.is_invalidated(path) {
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
                headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
            } else {
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(IMMUTABLE));
                headers.insert(header::PRAGMA, HeaderValue::from_static("public"));
            }
        }

        if let Some(content_type) = content_type_for(path) {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        headers
    }
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

// Relay an origin response the cache does not store
async fn relay(location: &AssetLocation, response: reqwest::Response) -> FetchOutcome {
    let status = response.status();
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if is_hop_by_hop(name)
            || name == header::CONTENT_LENGTH
            || name == header::CONTENT_ENCODING
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read HTTP {} body for {}: {}", status, location.url, e);
            return FetchOutcome::gateway_failure();
        }
    };
    FetchOutcome::Upstream {
        status,
        headers,
        body,
    }
}
