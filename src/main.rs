//! # Zapflow: Multi-channel bulk dispatch server
//!
//! Usage:
//!   zapflow                          # Serve with ~/.zapflow/config.toml
//!   zapflow --config ./zapflow.toml  # Custom config file
//!   zapflow --port 8080              # Override the listen port
//!   zapflow --check-channels         # Probe every channel once and exit

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use zapflow_core::config::ZapflowConfig;
use zapflow_gateway::AppState;

#[derive(Parser)]
#[command(
    name = "zapflow",
    version,
    about = "📨 Zapflow — WhatsApp/Telegram bulk dispatch with humanized pacing"
)]
struct Cli {
    /// Config file (default: ~/.zapflow/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address override
    #[arg(long)]
    host: Option<String>,

    /// Listen port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Probe every configured channel, print the result and exit
    #[arg(long)]
    check_channels: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "zapflow=debug,zapflow_channels=debug,zapflow_dispatch=debug,zapflow_gateway=debug,tower_http=debug"
    } else {
        "zapflow=info,zapflow_channels=info,zapflow_dispatch=info,zapflow_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(ZapflowConfig::default_path);
    let mut config = if config_path.exists() {
        ZapflowConfig::load_from(&config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else if cli.config.is_some() {
        anyhow::bail!("config file not found: {}", config_path.display());
    } else {
        tracing::warn!("⚠️ {} not found, using defaults", config_path.display());
        ZapflowConfig::default()
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let history_db = (!config.dispatch.history_db.trim().is_empty()).then(|| expand_path(&config.dispatch.history_db));
    let state = AppState::from_config(&config, history_db)?;
    let registry = state.engine.registry().clone();

    if cli.check_channels {
        for (id, s) in registry.refresh_all().await {
            println!("{id:<24} {s}");
        }
        return Ok(());
    }

    if registry.is_empty() {
        tracing::warn!("⚠️ No channels configured in {}", config_path.display());
    } else {
        let results = registry.refresh_all().await;
        let connected = results.iter().filter(|(_, s)| s.is_usable()).count();
        tracing::info!("📡 {}/{} channels connected", connected, results.len());
    }

    zapflow_gateway::start(&config, state).await
}
