// src/core/state/stats.rs

//! Contains state definitions and logic for proxy-wide statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Holds all state related to proxy-wide statistics and monitoring.
#[derive(Debug, Default)]
pub struct StatsState {
    /// The total number of sessions accepted since startup.
    total_sessions: AtomicU64,
    /// The total number of client requests processed since startup.
    total_requests: AtomicU64,
    /// The total number of backend fetches dispatched since startup.
    total_fetches: AtomicU64,
}

impl StatsState {
    /// Creates a new `StatsState` with initialized counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically increments the total number of sessions accepted.
    pub fn increment_total_sessions(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the total number of sessions accepted.
    pub fn get_total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    /// Atomically increments the total number of requests processed.
    pub fn increment_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the total number of requests processed.
    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Atomically increments the total number of fetches dispatched.
    pub fn increment_total_fetches(&self) {
        self.total_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the total number of fetches dispatched.
    pub fn get_total_fetches(&self) -> u64 {
        self.total_fetches.load(Ordering::Relaxed)
    }
}
