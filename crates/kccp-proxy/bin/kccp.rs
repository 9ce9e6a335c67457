//! KCCacheProxy binary entry point.
//!
//! This is a thin wrapper around the kccp-proxy library that:
//! 1. Initializes logging
//! 2. Parses and validates configuration
//! 3. Runs the proxy or the requested maintenance command
//!
//! Maintenance commands print their report as JSON on stdout.

use anyhow::Result;
use kccp_proxy::{Command, ProxyConfig, Server, commands};
use serde::Serialize;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ProxyConfig::from_args();
    config.validate()?;

    tracing::info!(
        "Configuration loaded: bind={}, origin={}, cache={:?}, modder={}",
        config.bind,
        config.origin,
        config.cache_dir,
        config.enable_modder
    );

    match config.command() {
        Command::Serve => {
            let server = Server::new(config).await?;
            server.run().await?;
        }
        Command::VerifyCache { delete } => {
            print_report(&commands::verify_cache(&config, delete).await?)?;
        }
        Command::Merge { source } => {
            print_report(&commands::merge(&config, &source).await?)?;
        }
        Command::Diff { baseline, output } => {
            print_report(&commands::diff(&config, &baseline, &output).await?)?;
        }
        Command::CheckMods => {
            print_report(&commands::check_mods(&config).await?)?;
        }
    }

    Ok(())
}

fn print_report(report: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
