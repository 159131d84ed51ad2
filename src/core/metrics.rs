// src/core/metrics.rs

//! Defines and registers Prometheus metrics for proxy monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, Histogram, TextEncoder, register_counter, register_gauge, register_histogram};

lazy_static! {
    // --- Server-wide Gauges ---
    /// The number of client sessions currently open.
    pub static ref OPEN_SESSIONS: Gauge =
        register_gauge!("citrine_open_sessions", "Number of currently open client sessions.").unwrap();
    /// The number of objects currently held by the cache.
    pub static ref CACHED_OBJECTS: Gauge =
        register_gauge!("citrine_cached_objects", "Number of object cores currently in the cache.").unwrap();
    /// The number of fetches currently in flight.
    pub static ref FETCHES_IN_FLIGHT: Gauge =
        register_gauge!("citrine_fetches_in_flight", "Number of backend fetches currently running.").unwrap();

    // --- Session / request counters ---
    /// The total number of sessions accepted since startup.
    pub static ref SESSIONS_TOTAL: Counter =
        register_counter!("citrine_sessions_total", "Total number of sessions accepted.").unwrap();
    /// The total number of client requests processed since startup.
    pub static ref REQUESTS_TOTAL: Counter =
        register_counter!("citrine_requests_total", "Total number of client requests processed.").unwrap();
    /// The total number of sessions dropped by admission control.
    pub static ref SESSIONS_DROPPED_TOTAL: Counter =
        register_counter!("citrine_sessions_dropped_total", "Total number of sessions refused under overload.").unwrap();

    // --- Cache counters ---
    /// The total number of cache hits.
    pub static ref CACHE_HITS_TOTAL: Counter =
        register_counter!("citrine_cache_hits_total", "Total number of cache hits.").unwrap();
    /// The total number of grace-mode (stale) hits.
    pub static ref CACHE_GRACE_HITS_TOTAL: Counter =
        register_counter!("citrine_cache_grace_hits_total", "Total number of stale objects served within grace.").unwrap();
    /// The total number of hit-for-pass / hit-for-miss lookups.
    pub static ref CACHE_HITPASS_TOTAL: Counter =
        register_counter!("citrine_cache_hitpass_total", "Total number of hit-for-pass or hit-for-miss lookups.").unwrap();
    /// The total number of cache misses.
    pub static ref CACHE_MISSES_TOTAL: Counter =
        register_counter!("citrine_cache_misses_total", "Total number of cache misses.").unwrap();
    /// The total number of requests parked on a busy object.
    pub static ref COALESCED_WAITS_TOTAL: Counter =
        register_counter!("citrine_coalesced_waits_total", "Total number of requests parked behind an in-flight fetch.").unwrap();

    // --- Fetch counters ---
    /// The total number of backend fetches started.
    pub static ref FETCHES_TOTAL: Counter =
        register_counter!("citrine_fetches_total", "Total number of backend fetches started.").unwrap();
    /// The total number of fetches that failed.
    pub static ref FETCH_FAILURES_TOTAL: Counter =
        register_counter!("citrine_fetch_failures_total", "Total number of backend fetches that failed.").unwrap();
    /// The total number of fetch retries.
    pub static ref FETCH_RETRIES_TOTAL: Counter =
        register_counter!("citrine_fetch_retries_total", "Total number of fetch dispatch retries.").unwrap();
    /// The total number of 304-based conditional refreshes.
    pub static ref COND_REFRESH_TOTAL: Counter =
        register_counter!("citrine_cond_refresh_total", "Total number of conditional (304) object refreshes.").unwrap();

    // --- Invalidation / lifetime counters ---
    /// The total number of objects removed by the expiry engine.
    pub static ref EXPIRED_OBJECTS_TOTAL: Counter =
        register_counter!("citrine_expired_objects_total", "Total number of objects expired.").unwrap();
    /// The total number of objects evicted through LRU nuking.
    pub static ref NUKED_OBJECTS_TOTAL: Counter =
        register_counter!("citrine_nuked_objects_total", "Total number of objects LRU-nuked for space.").unwrap();
    /// The total number of bans added.
    pub static ref BANS_ADDED_TOTAL: Counter =
        register_counter!("citrine_bans_added_total", "Total number of bans added.").unwrap();
    /// The total number of ban tests evaluated.
    pub static ref BAN_TESTS_TOTAL: Counter =
        register_counter!("citrine_ban_tests_total", "Total number of ban predicate evaluations.").unwrap();
    /// The total number of objects killed by bans.
    pub static ref BAN_KILLS_TOTAL: Counter =
        register_counter!("citrine_ban_kills_total", "Total number of objects invalidated by bans.").unwrap();

    // --- Error counters ---
    /// The total number of workspace overflows.
    pub static ref WS_OVERFLOWS_TOTAL: Counter =
        register_counter!("citrine_ws_overflows_total", "Total number of workspace overflows.").unwrap();
    /// The total number of synthetic responses delivered.
    pub static ref SYNTH_RESPONSES_TOTAL: Counter =
        register_counter!("citrine_synth_responses_total", "Total number of synthetic responses.").unwrap();
    /// The total number of log records pushed through the log plane.
    pub static ref VSL_RECORDS_TOTAL: Counter =
        register_counter!("citrine_vsl_records_total", "Total number of transaction log records emitted.").unwrap();

    // --- Histograms ---
    /// A histogram of time from request start to delivery completion.
    pub static ref REQUEST_LATENCY_SECONDS: Histogram =
        register_histogram!("citrine_request_latency_seconds", "Latency of request processing in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
