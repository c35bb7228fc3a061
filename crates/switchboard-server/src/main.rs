//! # Switchboard Server
//!
//! Namespace and room based realtime event server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! switchboard
//!
//! # Run with a config file in the working directory
//! cp switchboard.example.toml switchboard.toml && switchboard
//!
//! # Run with an explicit config file
//! SWITCHBOARD_CONFIG=/srv/switchboard.toml switchboard
//!
//! # Run with environment variables
//! SWITCHBOARD_PORT=8080 SWITCHBOARD_HOST=0.0.0.0 switchboard
//! SWITCHBOARD_LIMITS__MAX_CONNECTIONS=5000 switchboard
//! ```

mod chat;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "switchboard=debug";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Switchboard server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config, chat::dispatcher()).await?;

    Ok(())
}
