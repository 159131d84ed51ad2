// src/core/tasks/ban_lurker.rs

//! The ban lurker: a background task that eagerly evaluates object-only bans
//! so lookups stay cheap and the ban list stays short.

use crate::core::ban::BanVerdict;
use crate::core::state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The interval between lurker sweeps.
const LURKER_INTERVAL: Duration = Duration::from_secs(1);

/// A task that walks the object population testing pending bans.
pub struct BanLurker {
    state: Arc<ServerState>,
}

impl BanLurker {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Runs the main loop for the ban lurker.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Ban lurker started.");
        let mut interval = tokio::time::interval(LURKER_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Ban lurker shutting down.");
                    return;
                }
            }
        }
    }

    /// One sweep: every object whose ban pointer is behind the head gets its
    /// object-attribute bans evaluated; matches are dropped, survivors
    /// advance. Afterwards fully-checked bans are marked completed and the
    /// completed tail is trimmed.
    pub async fn sweep(&self) {
        let bans = &self.state.bans;
        if bans.is_empty() {
            return;
        }
        let head_seq = bans.head().seq;
        let mut kill_list = Vec::new();
        let mut min_seq = head_seq;

        self.state.store.for_each_oc(|oc| {
            let oc_seq = oc.ban_ref().map(|b| b.seq).unwrap_or(0);
            if oc_seq >= head_seq {
                return;
            }
            if oc.is_busy() || oc.is_unusable() {
                // Not testable yet; it keeps its older pointer.
                min_seq = min_seq.min(oc_seq);
                return;
            }
            match bans.check_oc(oc, None) {
                BanVerdict::Hit => kill_list.push(oc.clone()),
                BanVerdict::Clean | BanVerdict::Deferred => {
                    let after = oc.ban_ref().map(|b| b.seq).unwrap_or(0);
                    min_seq = min_seq.min(after);
                }
            }
        });

        for oc in &kill_list {
            debug!(oc = oc.id, "ban lurker dropping object");
            oc.set_flags(crate::core::objstore::objcore::OcFlags::PURGED);
            self.state.store.kill(oc);
        }
        if !kill_list.is_empty() {
            debug!("ban lurker dropped {} objects", kill_list.len());
        }

        bans.sweep_completed(min_seq);

        let cutoff = self.state.config.lock().await.cache.ban_cutoff;
        if cutoff > 0 && bans.len() > cutoff {
            // Objects pinned behind req-touching bans keep the list long;
            // beyond the cutoff they are evicted instead of tested.
            let mut evicted = 0usize;
            self.state.store.for_each_oc(|oc| {
                let oc_seq = oc.ban_ref().map(|b| b.seq).unwrap_or(0);
                if oc_seq < min_seq && !oc.is_busy() && !oc.is_unusable() {
                    self.state.store.kill(oc);
                    evicted += 1;
                }
            });
            if evicted > 0 {
                warn!(
                    "ban list over cutoff ({} > {}), evicted {} objects",
                    bans.len(),
                    cutoff,
                    evicted
                );
            }
        }
    }
}
