//! # Courier chat hub
//!
//! Real-time message delivery service: tracks live duplex sessions,
//! fans out locally, and bridges to other instances over a shared
//! pub/sub channel.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (single node, in-process bus)
//! courier-hub
//!
//! # Run with custom config
//! courier-hub   # reads courier.toml from the usual locations
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 courier-hub
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,courier_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Courier hub on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
