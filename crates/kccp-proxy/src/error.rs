//! Error types for the proxy.
//!
//! Startup and configuration failures surface as [`ServerError`]; failures of a
//! single proxied request are [`ProxyError`] and become plain-text responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kccp_cache::CacheError;
use kccp_patch::PatchError;
use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An option has an unusable value
    #[error("Invalid value for --{option}: {reason}")]
    InvalidValue {
        /// Option name without the leading dashes
        option: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Missing required configuration value
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// Command refused by the current configuration
    #[error("{0}")]
    Disabled(String),
}

/// Server runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the proxy listener
    #[error("Failed to bind proxy to {addr}: {source}")]
    HttpBindFailed {
        /// Address that failed to bind
        addr: std::net::SocketAddr,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cache engine error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Patch pipeline error
    #[error("Mod error: {0}")]
    Patch(#[from] PatchError),

    /// Server shutdown error
    #[error("Server shutdown error: {0}")]
    Shutdown(String),
}

/// Failure of one proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request resolves back to the proxy itself
    #[error("Attempted to proxy a loopback connection.")]
    Loopback,

    /// The request target cannot be turned into an absolute URL
    #[error("Invalid request target '{target}': {reason}")]
    InvalidTarget {
        /// Target as received
        target: String,
        /// Reason for invalidity
        reason: String,
    },

    /// The client's request body could not be read
    #[error("Failed to read request body: {0}")]
    Body(#[from] axum::Error),

    /// Forwarding to the destination failed
    #[error("Error proxying request: {0}")]
    Upstream(#[from] reqwest::Error),

    /// The tunnel destination could not be reached
    #[error("Error proxying request: {authority}: {source}")]
    Tunnel {
        /// Destination `host:port`
        authority: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    /// Status sent to the client for this error
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Loopback => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidTarget { .. } | Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) | Self::Tunnel { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
