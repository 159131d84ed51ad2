// src/server/spawner.rs

//! Spawns all background tasks: expiry engine, ban lurker, log mailman and
//! the metrics exporter.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::tasks::ban_lurker::BanLurker;
use crate::core::vsl;
use tracing::info;

/// Spawns every background task into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) {
    let init = ctx
        .init
        .take()
        .expect("spawner runs once, after initialization");

    let expiry = init.expiry;
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        expiry.run(shutdown_rx).await;
    });

    let lurker = BanLurker::new(ctx.state.clone());
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        lurker.run(shutdown_rx).await;
    });

    let vsl_rx = init.vsl_rx;
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        vsl::run_mailman(vsl_rx, shutdown_rx).await;
    });

    let state = ctx.state.clone();
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        let enabled = state.config.lock().await.metrics.enabled;
        if enabled {
            metrics_server::run_metrics_server(state, shutdown_rx).await;
        }
    });

    info!("Background tasks spawned.");
}
