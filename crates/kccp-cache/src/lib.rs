//! Conditional-fetch asset cache for a game client proxy
//!
//! This crate stores game assets fetched from a single origin and serves them
//! back without contacting the origin whenever the client's cache-busting
//! token still matches the stored copy.
//!
//! # Features
//!
//! - **Conditional fetch**: revalidation with `If-Modified-Since`, stale-copy
//!   fallback when the origin refuses or is unreachable
//! - **Single-flight**: concurrent requests for one path share one upstream fetch
//! - **Crash-safe persistence**: temp-write plus atomic rename for files, with
//!   single-generation backup rotation for the index document
//! - **Maintenance**: length verification, merge from another cache, and
//!   differential package export
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/
//!   cached.json          path -> {version, lastmodified, length, cache}
//!   cached.json.bak      previous generation
//!   kcs2/img/...         asset files, mirroring canonical paths
//! ```
//!
//! # Example
//!
//! ```no_run
//! use kccp_cache::{AssetRequest, CacheConfig, CacheEngine};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(CacheEngine::open(CacheConfig::new("./cache")).await?);
//! let response = engine
//!     .handle(&AssetRequest::new("http://203.104.209.71/kcs2/version.json?1.0"))
//!     .await;
//! println!("{} bytes from {:?}", response.body.len(), response.source);
//! engine.flush().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod index;
pub mod location;
pub mod merge;
pub mod origin;
pub mod persist;
pub mod record;
pub mod stats;
pub mod transform;
pub mod verify;

pub use config::CacheConfig;
pub use engine::{AssetRequest, CacheEngine, CacheResponse, GATEWAY_FAILURE, ResponseSource};
pub use error::{CacheError, CacheResult};
pub use index::{IndexSource, IndexStore};
pub use location::AssetLocation;
pub use merge::TransferReport;
pub use record::{CacheRecord, PatchedRecord};
pub use stats::{CacheStats, IndexSummary, Stat, StatsSnapshot};
pub use transform::AssetTransform;
pub use verify::VerifyReport;
