//! # ctxcache
//!
//! Shared versioned context cache server binary. Loads settings, installs
//! telemetry and serves the HTTP/WebSocket API until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ctxcache_server::ServerConfig;
use ctxcache_settings::{load_settings_from_path, settings_path, CacheSettings};
use ctxcache_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Shared versioned context cache.
#[derive(Parser, Debug)]
#[command(name = "ctxcache", about = "Shared versioned context cache server")]
struct Cli {
    /// Settings file (defaults to ~/.ctxcache/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides settings; RUST_LOG still wins).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut CacheSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn telemetry_config(settings: &CacheSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: parse_level(&settings.logging.level),
        module_levels: settings
            .logging
            .module_levels
            .iter()
            .map(|(module, level)| (module.clone(), parse_level(level)))
            .collect(),
        json: settings.logging.json,
        prometheus: settings.logging.prometheus,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    let telemetry = init_telemetry(telemetry_config(&settings));
    tracing::info!(settings = %path.display(), "starting ctxcache");

    let config = ServerConfig::from_settings(&settings).with_prometheus(telemetry.prometheus());
    let handle = ctxcache_server::start(config)
        .await
        .with_context(|| format!("Failed to bind {}:{}", settings.server.host, settings.server.port))?;
    tracing::info!(port = handle.port(), "ctxcache ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    handle.shutdown().await;
    tracing::info!("ctxcache stopped");
    Ok(())
}
