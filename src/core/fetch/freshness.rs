// src/core/fetch/freshness.rs

//! Freshness rules: deriving t_origin, ttl, grace and keep from a backend
//! response, and deciding cacheability.
//!
//! Simplified RFC 9111 semantics: s-maxage wins over max-age wins over
//! Expires, all measured from the origin timestamp derived from Date and Age.
//! Directive programs may override every derived value afterwards.

use crate::core::http::HttpMsg;
use crate::core::objstore::objcore::OcTtl;
use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime};

/// Status codes eligible for caching without explicit freshness info.
const CACHEABLE_STATUS: &[u16] = &[200, 203, 204, 300, 301, 302, 303, 304, 307, 404, 410, 414];

/// Defaults applied when the response carries no usable freshness info.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessDefaults {
    pub ttl: Duration,
    pub grace: Duration,
    pub keep: Duration,
}

/// The derived freshness decision for one backend response.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessDecision {
    pub ttl_state: OcTtl,
    /// False forces the object private (hit-for-miss candidate).
    pub cacheable: bool,
}

/// Parses an IMF-fixdate HTTP date.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).into())
}

/// Formats a `SystemTime` as an IMF-fixdate HTTP date.
pub fn format_http_date(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// One `Cache-Control` directive's numeric argument, if present and sane.
fn cc_number(cc: &str, directive: &str) -> Option<u64> {
    for part in cc.split(',') {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix(directive)
            && let Some(value) = rest.strip_prefix('=')
        {
            return value.trim().trim_matches('"').parse().ok();
        }
    }
    None
}

fn cc_flag(cc: &str, directive: &str) -> bool {
    cc.split(',').any(|part| {
        let part = part.trim();
        part == directive || part.starts_with(&format!("{directive}="))
    })
}

/// Computes the freshness decision for a backend response.
pub fn decide(beresp: &HttpMsg, now: SystemTime, defaults: FreshnessDefaults) -> FreshnessDecision {
    let cc = beresp.get_str("cache-control").unwrap_or("");

    // t_origin: the Date the origin stamped, pushed back by Age, clamped so
    // a skewed origin clock cannot produce future origins.
    let date = beresp
        .get_str("date")
        .and_then(parse_http_date)
        .unwrap_or(now)
        .min(now);
    let age = beresp
        .get_str("age")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);
    let t_origin = date
        .checked_sub(age)
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .min(now);

    let mut cacheable = CACHEABLE_STATUS.contains(&beresp.status);
    if cc_flag(cc, "no-store") || cc_flag(cc, "private") || cc_flag(cc, "no-cache") {
        cacheable = false;
    }
    if beresp.has("set-cookie") {
        cacheable = false;
    }
    if beresp
        .get_str("vary")
        .is_some_and(|v| v.split(',').any(|f| f.trim() == "*"))
    {
        cacheable = false;
    }

    let ttl = if let Some(s) = cc_number(cc, "s-maxage") {
        Some(Duration::from_secs(s))
    } else if let Some(s) = cc_number(cc, "max-age") {
        Some(Duration::from_secs(s))
    } else if let Some(expires) = beresp.get_str("expires") {
        match parse_http_date(expires) {
            Some(exp) => Some(exp.duration_since(date).unwrap_or(Duration::ZERO)),
            // An unparseable Expires means "already stale".
            None => Some(Duration::ZERO),
        }
    } else {
        None
    };
    let ttl = ttl.unwrap_or(defaults.ttl);

    // Grace extends TTL for serve-while-revalidate; stale-while-revalidate
    // from the origin overrides the configured default.
    let grace = cc_number(cc, "stale-while-revalidate")
        .map(Duration::from_secs)
        .unwrap_or(defaults.grace);

    FreshnessDecision {
        ttl_state: OcTtl {
            t_origin,
            ttl,
            grace,
            keep: defaults.keep,
        },
        cacheable,
    }
}
