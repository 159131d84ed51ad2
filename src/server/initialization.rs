// src/server/initialization.rs

//! Handles the complete proxy initialization process, from configuration to
//! state setup and listener binding.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::ServerState;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all proxy components before starting the main loop.
pub async fn setup(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    info!(
        "Citrine {} starting, backend {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.backend.host,
        config.backend.port
    );
    let (shutdown_tx, _) = broadcast::channel(1);

    let server_init = ServerState::initialize(config, log_reload_handle)?;
    let state = server_init.state.clone();
    info!("Proxy state initialized.");

    let listener = {
        let config = state.config.lock().await;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        info!("Citrine listening on {}:{}", config.host, config.port);
        listener
    };

    Ok(ServerContext {
        state,
        init: Some(server_init),
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}
