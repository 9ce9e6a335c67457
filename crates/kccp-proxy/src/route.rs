//! Request classification and URL normalization.
//!
//! Besides ordinary absolute-URI proxy requests the router accepts a few
//! shorthand forms, so a client pointed at the proxy as a plain web server can
//! still reach any host:
//!
//! ```text
//! /kcs2/version.json?1.0             https://<origin>/kcs2/version.json?1.0
//! /https/example.com/a/b             https://example.com/a/b
//! /https/w01a.kancolle-server.com/   https://w01a.kancolle-server.com/
//! /http/w01a/kcs2/index.php          http://w01a.kancolle-server.com/kcs2/index.php
//! ```

use crate::error::ProxyError;
use axum::http::{HeaderMap, HeaderValue, Method, header};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;
use url::{Host, Url};

/// Path fragments of game assets eligible for caching
pub const KC_PATHS: &[&str] = &[
    "/kcs/",
    "/kcs2/",
    "/kcscontents/",
    "/gadget_html5/",
    "/html/",
    "/kca/",
];

/// Headers that redirect a request to another host; stripped before forwarding
pub const HOST_OVERRIDE_HEADERS: &[&str] = &["x-kcp-host", "x-host"];

/// How a request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Through the cache engine
    Cache,
    /// Forwarded unmodified to its destination
    Passthrough,
}

/// Classify a request by method and URL path.
///
/// Only `GET`s for known asset paths are cached; dynamic `.php` endpoints
/// never are.
pub fn classify(method: &Method, path: &str) -> Route {
    if method == Method::GET
        && KC_PATHS.iter().any(|fragment| path.contains(fragment))
        && !path.contains(".php")
    {
        Route::Cache
    } else {
        Route::Passthrough
    }
}

/// Expand the scheme-and-host shorthand forms to an absolute URL.
///
/// Returns `None` when `raw` uses none of them.
pub fn expand_shorthand(raw: &str, alias_domain: &str) -> Option<String> {
    const FORMS: [(&str, &str); 4] = [
        ("/https/", "https"),
        ("/http/", "http"),
        ("https://", "https"),
        ("http://", "http"),
    ];
    let (scheme, rest) = FORMS
        .iter()
        .find_map(|(prefix, scheme)| raw.strip_prefix(prefix).map(|rest| (*scheme, rest)))?;

    let (host, path) = rest.find('/').map_or((rest, ""), |i| rest.split_at(i));
    if host.is_empty() {
        return None;
    }

    Some(match world_alias(host, alias_domain) {
        Some(alias) => format!("{scheme}://{alias}.{alias_domain}{path}"),
        None => format!("{scheme}://{host}{path}"),
    })
}

/// `w01a`-style world server names, bare or already qualified
fn world_alias<'a>(host: &'a str, alias_domain: &str) -> Option<&'a str> {
    let alias = host
        .strip_suffix(alias_domain)
        .and_then(|h| h.strip_suffix('.'))
        .unwrap_or(host);
    let bytes = alias.as_bytes();
    let is_alias = bytes.len() == 4
        && bytes[0] == b'w'
        && (b'0'..=b'2').contains(&bytes[1])
        && bytes[2].is_ascii_digit()
        && (bytes[3].is_ascii_alphanumeric() || bytes[3] == b'_');
    is_alias.then_some(alias)
}

/// A request resolved to its destination
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    /// Absolute destination URL
    pub url: Url,
    /// Headers to send, already adjusted for the destination
    pub headers: HeaderMap,
    /// How the request is served
    pub route: Route,
}

/// Resolves client requests to destinations
#[derive(Debug, Clone)]
pub struct RequestRouter {
    base: Url,
    alias_domain: String,
    bind: SocketAddr,
}

impl RequestRouter {
    /// Create a router resolving bare paths against `origin`.
    pub fn new(
        origin: &str,
        alias_domain: impl Into<String>,
        bind: SocketAddr,
    ) -> Result<Self, ProxyError> {
        let base =
            Url::parse(&format!("https://{origin}/")).map_err(|e| ProxyError::InvalidTarget {
                target: origin.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base,
            alias_domain: alias_domain.into(),
            bind,
        })
    }

    /// Resolve a request target to an absolute URL.
    pub fn resolve_url(&self, target: &str) -> Result<Url, ProxyError> {
        let expanded = expand_shorthand(target, &self.alias_domain);
        Url::options()
            .base_url(Some(&self.base))
            .parse(expanded.as_deref().unwrap_or(target))
            .map_err(|e| ProxyError::InvalidTarget {
                target: target.to_string(),
                reason: e.to_string(),
            })
    }

    /// Whether `url` points back at the proxy's own listener
    pub fn is_loopback(&self, url: &Url) -> bool {
        if url.port_or_known_default() != Some(self.bind.port()) {
            return false;
        }
        let ip = match url.host() {
            Some(Host::Domain(domain)) => return domain.eq_ignore_ascii_case("localhost"),
            Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
            Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
            None => return false,
        };
        ip.is_loopback() || ip == self.bind.ip()
    }

    /// Resolve a request and adjust its headers for the destination.
    ///
    /// `origin` and `referer` are expanded like the target, `host` is set to
    /// the destination, and a host override header replaces the destination
    /// host before being removed.
    pub fn route(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
    ) -> Result<RoutedRequest, ProxyError> {
        let mut url = self.resolve_url(target)?;
        let mut headers = headers.clone();

        for name in [header::ORIGIN, header::REFERER] {
            let expanded = headers
                .get(&name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| expand_shorthand(v, &self.alias_domain))
                .and_then(|v| HeaderValue::from_str(&v).ok());
            if let Some(value) = expanded {
                headers.insert(name, value);
            }
        }

        let host_override = HOST_OVERRIDE_HEADERS
            .iter()
            .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
            .map(ToString::to_string);
        for name in HOST_OVERRIDE_HEADERS {
            headers.remove(*name);
        }
        if let Some(host) = host_override {
            debug!("Host override {} for {}", host, url);
            set_authority(&mut url, &host).map_err(|reason| ProxyError::InvalidTarget {
                target: host.clone(),
                reason,
            })?;
        }

        if self.is_loopback(&url) {
            return Err(ProxyError::Loopback);
        }

        if let Some(host) = authority_of(&url).and_then(|a| HeaderValue::from_str(&a).ok()) {
            headers.insert(header::HOST, host);
        }

        let route = classify(method, url.path());
        Ok(RoutedRequest {
            url,
            headers,
            route,
        })
    }
}

/// `host[:port]` of `url`, omitting a default port
fn authority_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn set_authority(url: &mut Url, authority: &str) -> Result<(), String> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        _ => (authority, None),
    };
    url.set_host(Some(host)).map_err(|e| e.to_string())?;
    url.set_port(port)
        .map_err(|()| format!("cannot set port on {url}"))
}
