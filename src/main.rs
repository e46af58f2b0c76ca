//! line-relay: a minimal TCP chat relay
//!
//! Clients connect over TCP and send newline-delimited text. The first
//! line is taken as a display name; every following line is relayed
//! verbatim to all connected clients, including the sender. Joins and
//! departures are announced to everyone.
//!
//! Features:
//! - One lightweight task per connection
//! - Mutex-guarded connection registry
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod registry;
mod server;

use config::Config;
use server::Server;
use tracing::info;
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

    info!(listen = %config.listen, "Starting line-relay server");

    let server = Server::new(config);
    server.run().await?;
    Ok(())
}
