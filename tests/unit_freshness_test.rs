use bytes::Bytes;
use citrine::core::fetch::freshness::{
    FreshnessDefaults, decide, format_http_date, parse_http_date,
};
use citrine::core::http::HttpMsg;
use std::time::{Duration, SystemTime};

fn defaults() -> FreshnessDefaults {
    FreshnessDefaults {
        ttl: Duration::from_secs(120),
        grace: Duration::from_secs(10),
        keep: Duration::from_secs(30),
    }
}

fn resp(headers: &[(&str, &str)]) -> HttpMsg {
    let mut msg = HttpMsg::new_response(b"HTTP/1.1", 200, b"OK");
    for (n, v) in headers {
        msg.set(n, Bytes::copy_from_slice(v.as_bytes()));
    }
    msg
}

#[test]
fn test_http_date_round_trip() {
    let s = "Sun, 06 Nov 1994 08:49:37 GMT";
    let t = parse_http_date(s).unwrap();
    assert_eq!(format_http_date(t), s);
}

#[test]
fn test_max_age_sets_ttl() {
    let now = SystemTime::now();
    let d = decide(&resp(&[("cache-control", "max-age=60")]), now, defaults());
    assert!(d.cacheable);
    assert_eq!(d.ttl_state.ttl, Duration::from_secs(60));
    assert_eq!(d.ttl_state.grace, Duration::from_secs(10));
}

#[test]
fn test_s_maxage_wins_over_max_age() {
    let now = SystemTime::now();
    let d = decide(
        &resp(&[("cache-control", "max-age=60, s-maxage=300")]),
        now,
        defaults(),
    );
    assert_eq!(d.ttl_state.ttl, Duration::from_secs(300));
}

#[test]
fn test_expires_minus_date_sets_ttl() {
    let now = SystemTime::now();
    let date = now - Duration::from_secs(10);
    let expires = date + Duration::from_secs(100);
    let d = decide(
        &resp(&[
            ("date", &format_http_date(date)),
            ("expires", &format_http_date(expires)),
        ]),
        now,
        defaults(),
    );
    assert_eq!(d.ttl_state.ttl, Duration::from_secs(100));
}

#[test]
fn test_age_backdates_origin() {
    let now = SystemTime::now();
    let d = decide(
        &resp(&[
            ("date", &format_http_date(now)),
            ("age", "30"),
            ("cache-control", "max-age=60"),
        ]),
        now,
        defaults(),
    );
    let elapsed = now
        .duration_since(d.ttl_state.t_origin)
        .unwrap_or(Duration::ZERO);
    assert_eq!(elapsed.as_secs(), 30);
}

#[test]
fn test_no_freshness_info_uses_defaults() {
    let now = SystemTime::now();
    let d = decide(&resp(&[]), now, defaults());
    assert!(d.cacheable);
    assert_eq!(d.ttl_state.ttl, Duration::from_secs(120));
    assert_eq!(d.ttl_state.keep, Duration::from_secs(30));
}

#[test]
fn test_uncacheable_markers() {
    let now = SystemTime::now();
    assert!(!decide(&resp(&[("cache-control", "private")]), now, defaults()).cacheable);
    assert!(!decide(&resp(&[("cache-control", "no-store")]), now, defaults()).cacheable);
    assert!(!decide(&resp(&[("set-cookie", "a=b")]), now, defaults()).cacheable);
    assert!(!decide(&resp(&[("vary", "*")]), now, defaults()).cacheable);

    let mut teapot = resp(&[("cache-control", "max-age=60")]);
    teapot.status = 418;
    assert!(!decide(&teapot, now, defaults()).cacheable);
}

#[test]
fn test_stale_while_revalidate_overrides_default_grace() {
    let now = SystemTime::now();
    let d = decide(
        &resp(&[("cache-control", "max-age=60, stale-while-revalidate=600")]),
        now,
        defaults(),
    );
    assert_eq!(d.ttl_state.grace, Duration::from_secs(600));
}
