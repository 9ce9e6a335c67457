//! Hook for rewriting assets on their way out of the cache.

use crate::{location::AssetLocation, record::CacheRecord};
use async_trait::async_trait;
use bytes::Bytes;

/// Rewrites a successfully served asset body.
///
/// Implementations must not fail the request: on any internal error the
/// input body is returned unchanged.
#[async_trait]
pub trait AssetTransform: Send + Sync {
    /// Produce the body sent to the client for `asset`.
    async fn transform(
        &self,
        asset: &AssetLocation,
        record: Option<&CacheRecord>,
        body: Bytes,
    ) -> Bytes;
}
