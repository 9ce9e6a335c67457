//! HTTP proxy surface using axum.
//!
//! Every request reaches a single fallback handler: proxy requests carry
//! arbitrary absolute URIs, so there is no route table to match against.

use crate::error::ServerError;
use crate::server::AppState;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub mod handlers;
pub mod passthrough;
pub mod tunnel;

/// Create the proxy router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handlers::dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the proxy listener.
///
/// # Errors
///
/// Returns `ServerError` if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::HttpBindFailed { addr, source })
}

/// Serve proxy connections on `listener` until `shutdown` completes.
///
/// # Errors
///
/// Returns `ServerError` if the server encounters a runtime error.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let app = create_router(state);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Proxy listening on {}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Shutdown(format!("Proxy server error: {e}")))?;

    Ok(())
}
