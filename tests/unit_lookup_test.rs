mod common;

use citrine::core::objstore::boc::BocState;
use citrine::core::objstore::objcore::OcFlags;
use citrine::core::objstore::{Lookup, LookupParams};
use common::{CannedResp, MockBackend, MockDirector, digest_for, insert_object, make_req, test_env};
use std::time::Duration;

fn engine_env() -> common::TestEnv {
    let backend = MockBackend::new(vec![CannedResp::ok("x", "max-age=60")]);
    test_env(MockDirector::new(backend))
}

fn lookup_params<'a>(
    req: &'a citrine::core::req::Req,
    url: &str,
) -> LookupParams<'a> {
    LookupParams {
        digest: digest_for(url),
        req: &req.http,
        xid: req.vxid,
        grace_limit: None,
        hash_ignore_busy: false,
    }
}

#[tokio::test]
async fn test_miss_inserts_single_busy_placeholder() {
    let t = engine_env();
    let req = make_req(&t.env, "GET", "/a", &[]);

    let Lookup::Miss(handle) = t.store.lookup(lookup_params(&req, "/a")) else {
        panic!("expected miss");
    };
    assert!(handle.oc.is_busy());
    assert!(handle.coalescing);
    assert_eq!(handle.oc.refcnt(), 2);

    // A second lookup parks instead of inserting another busy object.
    let req2 = make_req(&t.env, "GET", "/a", &[]);
    let Lookup::Wait { .. } = t.store.lookup(lookup_params(&req2, "/a")) else {
        panic!("expected wait behind the busy object");
    };
    assert_eq!(t.store.object_count(), 1);
}

#[tokio::test]
async fn test_unbusy_wakes_each_waiter_exactly_once() {
    let t = engine_env();
    let req = make_req(&t.env, "GET", "/w", &[]);
    let Lookup::Miss(handle) = t.store.lookup(lookup_params(&req, "/w")) else {
        panic!("expected miss");
    };

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let req2 = make_req(&t.env, "GET", "/w", &[]);
        let Lookup::Wait { rx } = t.store.lookup(lookup_params(&req2, "/w")) else {
            panic!("expected wait");
        };
        waiters.push(rx);
    }

    handle.oc.set_ttl_state(citrine::core::objstore::objcore::OcTtl {
        t_origin: std::time::SystemTime::now(),
        ttl: Duration::from_secs(60),
        grace: Duration::ZERO,
        keep: Duration::ZERO,
    });
    handle.boc.set_state(BocState::ReqDone);
    t.store.unbusy(&handle);
    handle.boc.set_state(BocState::Finished);

    for rx in waiters {
        // Every parked request is woken exactly once (the oneshot resolves).
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("waiter was not woken")
            .expect("waker dropped without signal");
    }
    t.store.deref_oc(&handle.oc);
}

#[tokio::test]
async fn test_hash_ignore_busy_fetches_independently() {
    let t = engine_env();
    let req = make_req(&t.env, "GET", "/i", &[]);
    let Lookup::Miss(first) = t.store.lookup(lookup_params(&req, "/i")) else {
        panic!("expected miss");
    };

    let req2 = make_req(&t.env, "GET", "/i", &[]);
    let lookup = t.store.lookup(LookupParams {
        digest: digest_for("/i"),
        req: &req2.http,
        xid: req2.vxid,
        grace_limit: None,
        hash_ignore_busy: true,
    });
    let Lookup::Miss(second) = lookup else {
        panic!("expected independent miss");
    };
    // The independent fetch coalesces nobody and stays unlinked.
    assert!(!second.coalescing);
    assert_eq!(t.store.object_count(), 1);
    drop(first);
}

#[tokio::test]
async fn test_fresh_hit_takes_reference_and_counts() {
    let t = engine_env();
    let oc = insert_object(
        &t.store,
        &t.env,
        "/hit",
        200,
        &[("content-length", "1")],
        b"x",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    let req = make_req(&t.env, "GET", "/hit", &[]);
    let Lookup::Hit { oc: hit, graced, .. } = t.store.lookup(lookup_params(&req, "/hit")) else {
        panic!("expected hit");
    };
    assert!(!graced);
    assert_eq!(hit.refcnt(), 2);
    assert_eq!(oc.hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    t.store.deref_oc(&hit);
}

#[tokio::test]
async fn test_graced_hit_schedules_background_refresh() {
    let t = engine_env();
    insert_object(
        &t.store,
        &t.env,
        "/stale",
        200,
        &[],
        b"x",
        Duration::ZERO,
        Duration::from_secs(120),
        Duration::ZERO,
    );
    // Let the object age past its (zero) TTL.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let req = make_req(&t.env, "GET", "/stale", &[]);
    let Lookup::Hit { oc, graced, bgfetch } = t.store.lookup(lookup_params(&req, "/stale")) else {
        panic!("expected graced hit");
    };
    assert!(graced);
    let handle = bgfetch.expect("a revalidation miss should be scheduled");
    assert!(handle.oc.is_busy());
    assert!(handle.stale.is_some());

    // With the fetch in flight, the next graced hit schedules nothing.
    let req2 = make_req(&t.env, "GET", "/stale", &[]);
    let Lookup::Hit { oc: oc2, bgfetch: bg2, .. } =
        t.store.lookup(lookup_params(&req2, "/stale"))
    else {
        panic!("expected graced hit");
    };
    assert!(bg2.is_none());

    t.store.deref_oc(&oc);
    t.store.deref_oc(&oc2);
}

#[tokio::test]
async fn test_vary_separates_versions() {
    let t = engine_env();
    let req_gz = make_req(&t.env, "GET", "/v", &[("accept-encoding", "gzip")]);
    let Lookup::Miss(handle) = t.store.lookup(lookup_params(&req_gz, "/v")) else {
        panic!("expected miss");
    };
    // The fetcher publishes the vary description before unbusy.
    let beresp = {
        let mut b = citrine::core::http::HttpMsg::new_response(b"HTTP/1.1", 200, b"OK");
        b.set("vary", &b"Accept-Encoding"[..]);
        b
    };
    let citrine::core::objstore::vary::VaryBuild::Desc(desc) =
        citrine::core::objstore::vary::build(&beresp, &req_gz.http).unwrap()
    else {
        panic!("expected vary description");
    };
    handle.boc.set_vary(Some(desc));
    handle.oc.set_ttl_state(citrine::core::objstore::objcore::OcTtl {
        t_origin: std::time::SystemTime::now(),
        ttl: Duration::from_secs(60),
        grace: Duration::ZERO,
        keep: Duration::ZERO,
    });
    t.store.unbusy(&handle);
    handle.boc.set_state(BocState::Finished);
    t.store.deref_oc(&handle.oc);

    // The same URL with a different Accept-Encoding misses.
    let req_plain = make_req(&t.env, "GET", "/v", &[]);
    assert!(matches!(
        t.store.lookup(lookup_params(&req_plain, "/v")),
        Lookup::Miss(_)
    ));

    // The matching variant hits.
    let req_gz2 = make_req(&t.env, "GET", "/v", &[("accept-encoding", "gzip")]);
    let Lookup::Hit { oc, .. } = t.store.lookup(lookup_params(&req_gz2, "/v")) else {
        panic!("expected variant hit");
    };
    t.store.deref_oc(&oc);
}

#[tokio::test]
async fn test_hit_for_pass_returns_pass() {
    let t = engine_env();
    let oc = insert_object(
        &t.store,
        &t.env,
        "/hfp",
        200,
        &[],
        b"",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    oc.set_flags(OcFlags::HFP);

    let req = make_req(&t.env, "GET", "/hfp", &[]);
    let Lookup::Pass { oc: pass_oc } = t.store.lookup(lookup_params(&req, "/hfp")) else {
        panic!("expected hit-for-pass");
    };
    t.store.deref_oc(&pass_oc);
}

#[tokio::test]
async fn test_hit_for_miss_skips_coalescing() {
    let t = engine_env();
    let oc = insert_object(
        &t.store,
        &t.env,
        "/hfm",
        200,
        &[],
        b"",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    oc.set_flags(OcFlags::HFM);

    let req = make_req(&t.env, "GET", "/hfm", &[]);
    let Lookup::Miss(handle) = t.store.lookup(lookup_params(&req, "/hfm")) else {
        panic!("expected hit-for-miss");
    };
    assert!(handle.uncacheable);
    assert!(!handle.coalescing);
}

#[tokio::test]
async fn test_purge_digest_empties_the_bucket() {
    let t = engine_env();
    insert_object(
        &t.store,
        &t.env,
        "/p",
        200,
        &[],
        b"x",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    assert_eq!(t.store.purge_digest(&digest_for("/p")), 1);
    assert_eq!(t.store.object_count(), 0);

    let req = make_req(&t.env, "GET", "/p", &[]);
    assert!(matches!(
        t.store.lookup(lookup_params(&req, "/p")),
        Lookup::Miss(_)
    ));
}
