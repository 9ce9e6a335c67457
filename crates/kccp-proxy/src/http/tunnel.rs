//! CONNECT tunnels.
//!
//! The destination is dialed before the client gets its `200`, so an
//! unreachable host is reported as a `502` instead of a dead tunnel. Tunneled
//! bytes are copied as-is in both directions.

use crate::error::ProxyError;
use crate::server::AppState;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderValue, Uri},
    response::Response,
};
use hyper::{ext::ReasonPhrase, upgrade::Upgraded};
use hyper_util::rt::TokioIo;
use kccp_cache::Stat;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const DEFAULT_TUNNEL_PORT: u16 = 443;

/// `host:port` a CONNECT request asks for
pub fn tunnel_authority(uri: &Uri) -> Option<String> {
    let authority = uri.authority()?;
    Some(format!(
        "{}:{}",
        authority.host(),
        authority.port_u16().unwrap_or(DEFAULT_TUNNEL_PORT)
    ))
}

/// Dial the requested destination and hand the connection over to a tunnel.
///
/// # Errors
///
/// Returns `ProxyError` if the request names no destination or the
/// destination cannot be reached.
pub async fn open(state: &AppState, request: Request) -> Result<Response, ProxyError> {
    let Some(authority) = tunnel_authority(request.uri()) else {
        return Err(ProxyError::InvalidTarget {
            target: request.uri().to_string(),
            reason: "CONNECT requires host:port".to_string(),
        });
    };
    info!("CONNECT: {}", authority);
    state.stats().record(Stat::PassthroughHttps);
    state.stats().record(Stat::Passthrough);

    let upstream = TcpStream::connect(&authority).await.map_err(|source| {
        warn!("Server socket error for {}: {}", authority, source);
        ProxyError::Tunnel {
            authority: authority.clone(),
            source,
        }
    })?;

    let on_upgrade = hyper::upgrade::on(request);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => match pipe(upgraded, upstream).await {
                Ok((sent, received)) => debug!(
                    "Tunnel to {} closed, {} bytes out, {} bytes in",
                    authority, sent, received
                ),
                Err(e) => debug!("Tunnel to {} failed: {}", authority, e),
            },
            Err(e) => warn!("Socket error upgrading tunnel to {}: {}", authority, e),
        }
    });

    let mut response = Response::new(Body::empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
        .headers_mut()
        .insert("proxy-agent", HeaderValue::from_static("kccp"));
    Ok(response)
}

async fn pipe(upgraded: Upgraded, mut upstream: TcpStream) -> std::io::Result<(u64, u64)> {
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await
}
