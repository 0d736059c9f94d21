//! # Agora Server
//!
//! Real-time chat hub for the forum: public rooms, private conversations,
//! notification listeners and online presence.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! agora
//!
//! # Run with environment variables
//! AGORA_PORT=8080 AGORA_HOST=0.0.0.0 AGORA_DATABASE_URL=sqlite://forum.db agora
//! ```
//!
//! An `agora.toml` in the working directory, `/etc/agora/` or
//! `~/.config/agora/` takes precedence over the environment.

mod config;
mod handlers;
mod metrics;
mod sqlite;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Agora server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
