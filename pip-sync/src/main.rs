//! pip-sync daemon
//!
//! Hosts the Store on a Unix socket. Detectors and the browser-side shell
//! connect through the native messaging host.

use pip_sync::{Config, SyncServer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.general.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Configuration loaded from {:?}", Config::default_config_path());

    if !config.general.enabled {
        info!("pip-sync is disabled in configuration, exiting");
        return Ok(());
    }

    let server = SyncServer::new(config);
    let socket_path = server.socket_path().to_path_buf();
    info!("Press Ctrl+C to stop");

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    // Clean up socket file
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    Ok(())
}
