//! Forwarding of requests that bypass the cache.
//!
//! Request bodies (game API calls) are small and read in full; response
//! bodies are streamed back without buffering.

use crate::error::ProxyError;
use crate::route::RoutedRequest;
use crate::server::AppState;
use axum::{
    body::{Body, to_bytes},
    http::{HeaderMap, Method, header},
    response::{IntoResponse, Response},
};
use kccp_cache::{Stat, origin::is_hop_by_hop};

/// Largest request body accepted for forwarding
pub const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

/// Forward a request to its destination and relay the answer.
///
/// # Errors
///
/// Returns `ProxyError` if the request body cannot be read or the
/// destination cannot be reached.
pub async fn forward(
    state: &AppState,
    method: Method,
    routed: RoutedRequest,
    body: Body,
) -> Result<Response, ProxyError> {
    state.stats().record(Stat::PassthroughHttp);
    state.stats().record(Stat::Passthrough);

    let body = to_bytes(body, MAX_REQUEST_BODY).await?;
    let mut headers = end_to_end(&routed.headers);
    headers.remove(header::CONTENT_LENGTH);
    let mut request = state
        .client()
        .request(method, routed.url.clone())
        .headers(headers);
    if !body.is_empty() {
        request = request.body(body);
    }

    let upstream = request.send().await.map_err(|e| {
        tracing::warn!("Error proxying request to {}: {}", routed.url, e);
        ProxyError::Upstream(e)
    })?;

    let status = upstream.status();
    let headers = end_to_end(upstream.headers());
    Ok((status, headers, Body::from_stream(upstream.bytes_stream())).into_response())
}

/// Copy of `headers` without hop-by-hop headers
fn end_to_end(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}
