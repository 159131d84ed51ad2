// src/server/connection_loop.rs

//! Contains the main accept loop and graceful shutdown handling.

use super::context::ServerContext;
use crate::connection::ConnectionHandler;
use crate::core::metrics;
use std::sync::atomic::Ordering;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal based on the operating system.
/// On Unix, it listens for SIGINT and SIGTERM.
/// On Windows, it listens for Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("Failed to create Ctrl+C stream");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, initiating graceful shutdown."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, initiating graceful shutdown."); } } => {},
    }
}

/// The main loop: accepts sessions, applies admission control, and handles
/// graceful shutdown.
pub async fn run(mut ctx: ServerContext) {
    let mut session_tasks = JoinSet::new();

    loop {
        // Reap finished session tasks so the set stays small.
        while session_tasks.try_join_next().is_some() {}

        tokio::select! {
            biased; // Prioritize shutdown signals over other events.

            _ = await_shutdown_signal() => {
                break;
            },

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(()) => info!("A background task has completed."),
                    Err(e) => { error!("CRITICAL: background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        let max_sessions = ctx.state.config.lock().await.max_sessions;
                        if ctx.state.open_sessions.load(Ordering::Relaxed) >= max_sessions {
                            // Admission control: refuse rather than degrade.
                            metrics::SESSIONS_DROPPED_TOTAL.inc();
                            warn!("session limit reached, refusing {}", addr);
                            drop(socket);
                            continue;
                        }
                        debug!("Accepted new session from {}", addr);
                        ctx.state.stats.increment_total_sessions();
                        metrics::SESSIONS_TOTAL.inc();
                        metrics::OPEN_SESSIONS.inc();
                        ctx.state.open_sessions.fetch_add(1, Ordering::Relaxed);

                        let state = ctx.state.clone();
                        let shutdown_rx = ctx.shutdown_tx.subscribe();
                        session_tasks.spawn(async move {
                            let handler = ConnectionHandler::new(socket, addr, state.clone()).await;
                            if let Err(e) = handler.run(shutdown_rx).await {
                                debug!("session from {} ended with error: {}", addr, e);
                            }
                            state.open_sessions.fetch_sub(1, Ordering::Relaxed);
                            metrics::OPEN_SESSIONS.dec();
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            },
        }
    }

    info!("Shutting down: notifying background tasks and draining sessions.");
    let _ = ctx.shutdown_tx.send(());
    let linger = ctx.state.config.lock().await.timeouts.timeout_linger;
    let _ = tokio::time::timeout(linger, async {
        while session_tasks.join_next().await.is_some() {}
    })
    .await;
    ctx.background_tasks.shutdown().await;
    info!("Shutdown complete.");
}
