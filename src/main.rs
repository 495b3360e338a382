//! chat-relay: a WebSocket broadcast relay
//!
//! Clients connect over WebSocket and send JSON envelopes:
//!
//! ```text
//! {"action":"sendmessage","data":"hello"}
//! ```
//!
//! The `data` value is forwarded verbatim to every connected client,
//! the sender included. Connections found closed are dropped from the
//! registry as they are discovered.
//!
//! Features:
//! - One registry of live connections shared by all connection tasks
//! - Best-effort, at-most-once delivery per broadcast
//! - Graceful shutdown on SIGINT/SIGTERM with a bounded grace period
//! - Configuration via CLI arguments, `PORT`, or a TOML file

mod config;
mod error;
mod protocol;
mod registry;
mod server;

use config::Config;
use registry::ConnectionManager;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        shutdown_grace_ms = config.shutdown_grace.as_millis() as u64,
        handshake_timeout_ms = config.handshake_timeout.as_millis() as u64,
        version = env!("CARGO_PKG_VERSION"),
        "Starting chat-relay"
    );

    let manager = ConnectionManager::new();

    let server = match Server::bind(&config, manager).await {
        Ok(server) => server,
        Err(e) => {
            error!(addr = e.bind_addr().unwrap_or("-"), error = %e, "Failed to start relay");
            std::process::exit(1);
        }
    };

    server.run(server::shutdown_signal()).await?;

    info!("Relay stopped");
    Ok(())
}
