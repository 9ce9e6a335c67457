//! Proxy configuration management.
//!
//! Every option can be given on the command line or through a `KCCP_*`
//! environment variable, and applies to all subcommands.
//!
//! # Example
//!
//! ```no_run
//! use kccp_proxy::ProxyConfig;
//!
//! let config = ProxyConfig::from_args();
//! config.validate().expect("Invalid configuration");
//!
//! println!("Proxy will bind to: {}", config.bind);
//! println!("Cache directory: {}", config.cache_dir.display());
//! ```

use crate::error::ConfigError;
use clap::{Parser, Subcommand};
use kccp_cache::CacheConfig;
use kccp_patch::PipelineConfig;
use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// Proxy configuration loaded from CLI args and environment variables.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "kccp",
    about = "Caching proxy for KanColle game assets",
    version
)]
pub struct ProxyConfig {
    /// Listen address of the proxy
    #[arg(long, env = "KCCP_BIND", default_value = "127.0.0.1:8081", global = true)]
    pub bind: SocketAddr,

    /// Game server host used for requests that only carry a path
    #[arg(long, env = "KCCP_ORIGIN", default_value = "127.0.0.1", global = true)]
    pub origin: String,

    /// Directory holding cached assets and the cache index
    #[arg(long, env = "KCCP_CACHE_DIR", default_value = "./cache", global = true)]
    pub cache_dir: PathBuf,

    /// Check file lengths on every cache hit and allow `verify-cache`
    #[arg(long, env = "KCCP_VERIFY_CACHE", global = true)]
    pub verify_cache: bool,

    /// Tell clients not to keep their own copies
    #[arg(long, env = "KCCP_DISABLE_BROWSER_CACHE", global = true)]
    pub disable_browser_cache: bool,

    /// Connect and read timeout for upstream requests, in seconds
    #[arg(long, env = "KCCP_UPSTREAM_TIMEOUT", default_value_t = 30, global = true)]
    pub upstream_timeout: u64,

    /// Apply the packs listed in `--mods` to served assets
    #[arg(long, env = "KCCP_ENABLE_MODDER", global = true)]
    pub enable_modder: bool,

    /// JSON file listing the installed mod packs
    #[arg(long, env = "KCCP_MODS", global = true)]
    pub mods: Option<PathBuf>,

    /// Domain appended to short world-server aliases such as `w01a`
    #[arg(
        long,
        env = "KCCP_ALIAS_DOMAIN",
        default_value = "kancolle-server.com",
        global = true
    )]
    pub alias_domain: String,

    /// File the request counters are loaded from and saved to
    #[arg(long, env = "KCCP_STATS_FILE", global = true)]
    pub stats_file: Option<PathBuf>,

    /// Operation to run
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operations of the `kccp` binary.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the proxy (default)
    Serve,
    /// Compare every recorded file length with the file on disk
    VerifyCache {
        /// Remove files whose length does not match
        #[arg(long)]
        delete: bool,
    },
    /// Import the entries of another cache directory or package
    Merge {
        /// Cache directory or `.tar.gz` package
        source: PathBuf,
    },
    /// Package the entries that changed relative to an older index
    Diff {
        /// Index document to compare against
        baseline: PathBuf,
        /// Package file to write
        output: PathBuf,
    },
    /// Scan the mod packs and report what they contain.
    ///
    /// A running proxy rescans its packs on `SIGHUP` instead.
    CheckMods,
}

impl ProxyConfig {
    /// Parse configuration from command-line arguments.
    #[must_use]
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Operation to run, `serve` when none was given
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    /// Upstream timeout as a duration
    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    /// Cache engine settings derived from this configuration
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(&self.cache_dir)
            .with_verify_cache(self.verify_cache)
            .with_disable_browser_cache(self.disable_browser_cache)
            .with_upstream_timeout(self.upstream_timeout())
    }

    /// Patch pipeline settings derived from this configuration
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::new(&self.cache_dir).with_script_timeout(self.upstream_timeout())
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - The upstream timeout is zero
    /// - The origin or alias domain is empty or contains a path
    /// - The modder is enabled without an existing mods file
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                option: "upstream-timeout",
                reason: "must be greater than 0".to_string(),
            });
        }

        for (option, value) in [("origin", &self.origin), ("alias-domain", &self.alias_domain)] {
            if value.is_empty() || value.contains('/') {
                return Err(ConfigError::InvalidValue {
                    option,
                    reason: format!("'{value}' is not a host name"),
                });
            }
        }

        let needs_mods = self.enable_modder || self.command() == Command::CheckMods;
        match &self.mods {
            None if needs_mods => {
                return Err(ConfigError::MissingRequired(
                    "--mods is required when the modder is enabled".to_string(),
                ));
            }
            Some(mods) if needs_mods && !mods.exists() => {
                return Err(ConfigError::MissingRequired(format!(
                    "mods file not found: {}",
                    mods.display()
                )));
            }
            _ => {}
        }

        Ok(())
    }
}
