//! weftd - Weft encrypted event sync daemon
//!
//! Maintains the device's append-only encrypted event log and reconciles it
//! with configured peers over UDP using Bloom-filter digests.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weftd::config::Config;
use weftd::server::Server;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("weftd=info".parse().unwrap()))
        .init();

    // Parse configuration
    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "weftd v{} - Weft Event Sync Daemon",
        env!("CARGO_PKG_VERSION")
    );

    // Create and run server
    match Server::new(config).await {
        Ok(server) => {
            let server = Arc::new(server);

            let shutdown_server = server.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received shutdown signal");
                shutdown_server.shutdown();
            });

            if let Err(e) = server.run().await {
                error!("Server error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Failed to initialize server: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
