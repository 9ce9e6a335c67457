//! HTTP client used for origin requests.

use crate::error::CacheResult;
use reqwest::header::{self, HeaderMap, HeaderName};
use std::{sync::Once, time::Duration};

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the process-wide rustls crypto provider.
///
/// reqwest is built without a bundled provider, so one has to be installed
/// before the first TLS client is created. Safe to call repeatedly.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build the client shared by cache fetches and passthrough requests.
///
/// Redirects are never followed: the game client must see them as sent.
pub fn build_client(timeout: Duration) -> CacheResult<reqwest::Client> {
    ensure_crypto_provider();
    let client = reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    Ok(client)
}

// Connection-level headers that must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` is a hop-by-hop header.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Client headers to forward on a cache fetch.
///
/// Host and content negotiation are left to the HTTP client, and client
/// conditional headers are dropped because revalidation uses the stored
/// `Last-Modified` only.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::ACCEPT_ENCODING
            || name == header::CONTENT_LENGTH
            || name == header::IF_MODIFIED_SINCE
            || name == header::IF_NONE_MATCH
            || name == header::RANGE
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_forwardable_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1:8081"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("game"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"),
        );
        headers.insert(header::REFERER, HeaderValue::from_static("http://1.2.3.4/"));

        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded.len(), 2);
        assert!(forwarded.contains_key(header::USER_AGENT));
        assert!(forwarded.contains_key(header::REFERER));
    }

    #[test]
    fn test_build_client() {
        assert!(build_client(Duration::from_secs(5)).is_ok());
    }
}
