//! Request dispatch.

use crate::error::ProxyError;
use crate::http::{passthrough, tunnel};
use crate::route::{Route, RoutedRequest};
use crate::server::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    response::{IntoResponse, Response},
};
use kccp_cache::{AssetRequest, Stat};
use std::sync::Arc;

/// Handle any proxied request.
///
/// `CONNECT` opens a tunnel; everything else is resolved to its destination
/// and either served through the cache or forwarded.
///
/// # Errors
///
/// Returns `ProxyError` if the target is invalid, loops back to the proxy,
/// or cannot be reached.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ProxyError> {
    if request.method() == Method::CONNECT {
        return tunnel::open(&state, request).await;
    }

    let method = request.method().clone();
    let target = request.uri().to_string();
    tracing::debug!("{}: {}", method, target);

    let routed = state.router().route(&method, &target, request.headers())?;
    match routed.route {
        Route::Cache => Ok(serve_cached(&state, routed).await),
        Route::Passthrough => {
            passthrough::forward(&state, method, routed, request.into_body()).await
        }
    }
}

async fn serve_cached(state: &AppState, routed: RoutedRequest) -> Response {
    state.stats().record(Stat::TotalHandled);

    let request = AssetRequest::new(routed.url.as_str()).with_headers(routed.headers);
    let response = state.engine().handle(&request).await;
    tracing::debug!(
        "{} served from {:?} with {}",
        routed.url,
        response.source,
        response.status
    );

    (response.status, response.headers, Body::from(response.body)).into_response()
}
