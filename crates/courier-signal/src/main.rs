//! # Courier signaling service
//!
//! Pairs call participants into rooms and relays session-description and
//! ICE data between them while each pair negotiates a direct connection.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier-signal
//!
//! # Run with environment variables
//! COURIER_SIGNAL_PORT=8081 courier-signal
//! ```

mod config;
mod handlers;
mod metrics;
mod rooms;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_signal=debug,courier_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        "Starting Courier signaling on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
