//! fastsocket: framed TCP services built from message schemas.
//!
//! Bundled services:
//! - `echo`: line echo
//! - `means`: per-connection price history with mean queries
//! - `heartbeat`: ping/pong with periodic heartbeats after a handshake
//! - `kv`: shared key-value store
//!
//! Configuration via CLI arguments or TOML file.

use fastsocket::config::{Config, Service};
use fastsocket::protocols::{echo, heartbeat, kv, means};
use fastsocket::runtime::Protocol;
use fastsocket::server::Server;
use fastsocket::storage::Store;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        listen = %config.listen,
        service = ?config.service,
        workers = config.workers,
        max_connections = config.max_connections,
        "Starting fastsocket server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    match config.service {
        Service::Echo => serve(&config, echo::protocol()?).await,
        Service::Means => serve(&config, means::protocol()?).await,
        Service::Heartbeat => serve(&config, heartbeat::protocol()?).await,
        Service::Kv => serve(&config, kv::protocol(Store::new())?).await,
    }
}

async fn serve<S: Send + 'static>(
    config: &Config,
    protocol: Protocol<S>,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config.listen, protocol, config.max_connections)?;
    server.run().await?;
    Ok(())
}
