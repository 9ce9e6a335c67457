//! Caching proxy for KanColle game assets.
//!
//! The proxy sits between the game client and the game servers:
//! - Asset `GET`s under the known game paths are served through the
//!   [`kccp_cache`] engine, optionally rewritten by [`kccp_patch`] mod packs
//! - Everything else (API calls, `.php` pages, other hosts) is forwarded
//! - `CONNECT` requests become raw TCP tunnels
//!
//! # Architecture
//!
//! - `config`: CLI and environment configuration
//! - `route`: request classification and URL shorthand expansion
//! - `http`: axum surface with the cache, passthrough and tunnel handlers
//! - `server`: shared state, startup and graceful shutdown
//! - `commands`: maintenance operations run instead of the proxy
//!
//! # Example
//!
//! ```no_run
//! use kccp_proxy::{ProxyConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tracing_subscriber::fmt::init();
//!
//!     let config = ProxyConfig::from_args();
//!     config.validate()?;
//!
//!     let server = Server::new(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod route;
pub mod server;

pub use config::{Command, ProxyConfig};
pub use error::{ConfigError, ProxyError, ServerError};
pub use route::{RequestRouter, Route, RoutedRequest};
pub use server::{AppState, Server};
