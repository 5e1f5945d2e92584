//! Memora - versioned conversational memory
//!
//! HTTP server over the memory pipeline: interactions in, memories out,
//! backed by a SQLite relationship graph and a hybrid semantic index.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memora_core::{config, AppState, Error, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memora=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::init();
    tracing::info!(
        "Starting Memora server on {}:{}",
        config.server.host,
        config.server.port
    );

    let state = AppState::from_config(config).await?;
    tracing::info!(
        index = state.memora.has_index(),
        "Application state initialized"
    );

    let app = memora_core::app(state, config.server.max_body_bytes);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid listen address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
