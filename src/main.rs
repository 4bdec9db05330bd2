//! Gateway process entry point.
//!
//! Usage: `session-gateway [config.json]` (default `proxy_config.json`).

use session_gateway::config::{ProxyConfig, DEFAULT_CONFIG_PATH};
use session_gateway::error::Result;
use session_gateway::proxy::ProxyManager;
use session_gateway::utils::logging::init_logging;
use std::process::ExitCode;
use tracing::{error, info};

fn load_config(path: &str) -> Result<ProxyConfig> {
    let config = ProxyConfig::from_file(path)?;
    config.validate_strict()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let manager = match ProxyManager::new(config) {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "Failed to create gateway");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = manager.start().await {
        error!(error = %e, "Failed to start gateway");
        tokio::task::block_in_place(|| manager.stop());
        return ExitCode::FAILURE;
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received CTRL+C signal, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Joins the lane threads.
    tokio::task::block_in_place(|| manager.stop());
    ExitCode::SUCCESS
}
