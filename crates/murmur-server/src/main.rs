//! # murmur-server
//!
//! Real-time chat server for murmur.
//!
//! This binary provides:
//! - **WebSocket endpoint** delivering messages, reactions, read receipts,
//!   presence and typing signals to every authorized channel member
//! - **Message pipeline** that authorizes, validates and persists a message
//!   before anyone sees it
//! - **REST API** (axum) for health checks, history pages and deletion
//! - **SQLite storage** through `murmur-store`

mod api;
mod auth;
mod config;
mod error;
mod gate;
mod hub;
mod pipeline;
mod presence;
mod registry;
#[cfg(test)]
mod test_support;
mod typing;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use murmur_store::{ChatStore, SqliteStore};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::hub::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_server=debug")),
        )
        .init();

    info!("Starting murmur server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.session_pubkey == [0u8; 32] {
        tracing::warn!("SESSION_PUBKEY not set, every connection will be refused");
    }

    // -----------------------------------------------------------------------
    // 3. Open the store and build the hub
    // -----------------------------------------------------------------------
    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::open(&config.database_path)?);
    info!(path = %config.database_path.display(), "Database opened");

    let app_state = AppState {
        hub: Hub::new(store, &config),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
