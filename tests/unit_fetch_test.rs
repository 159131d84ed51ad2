mod common;

use citrine::core::fetch::{self, BusyObj};
use citrine::core::http::HttpMsg;
use citrine::core::objstore::boc::BocState;
use citrine::core::objstore::objcore::OcFlags;
use citrine::core::objstore::{Lookup, LookupParams};
use citrine::core::vcl::{
    ActionMask, MethodMask, VclAction, VclCtx, VclProgram, builtin_program,
};
use citrine::core::vsl::next_vxid;
use common::{CannedResp, MockBackend, MockDirector, digest_for, insert_object, make_req, test_env};
use std::sync::Arc;
use std::time::Duration;

/// Drives one full fetch for `url`, returning the handle's object core.
async fn fetch_once(
    t: &common::TestEnv,
    url: &str,
) -> Arc<citrine::core::objstore::objcore::ObjCore> {
    let req = make_req(&t.env, "GET", url, &[]);
    let Lookup::Miss(handle) = t.store.lookup(LookupParams {
        digest: digest_for(url),
        req: &req.http,
        xid: req.vxid,
        grace_limit: None,
        hash_ignore_busy: false,
    }) else {
        panic!("expected miss for {url}");
    };
    let oc = handle.oc.clone();
    oc.take_ref();
    let bereq = fetch::build_bereq(&req.http, None);
    let bo = BusyObj::new(next_vxid(), bereq, handle, &t.env.fetch);
    fetch::run_fetch(t.env.fetch.clone(), bo).await;
    oc
}

#[tokio::test]
async fn test_successful_fetch_populates_object() {
    let backend = MockBackend::new(vec![
        CannedResp::ok("abc", "max-age=60").with_header("etag", "\"v1\""),
    ]);
    let t = test_env(MockDirector::new(backend.clone()));

    let oc = fetch_once(&t, "/a").await;
    assert!(!oc.is_busy());
    assert!(oc.boc().is_none());
    let obj = oc.obj().expect("object body present");
    assert_eq!(obj.body_bytes().as_ref(), b"abc");
    let attrs = obj.attrs();
    assert_eq!(attrs.status, 200);
    assert_eq!(attrs.len, 3);
    assert_eq!(attrs.etag.as_deref(), Some(&b"\"v1\""[..]));
    assert_eq!(oc.ttl_state().ttl, Duration::from_secs(60));
    assert_eq!(backend.call_count(), 1);

    // The object is now a cache hit.
    let req = make_req(&t.env, "GET", "/a", &[]);
    let Lookup::Hit { oc: hit, .. } = t.store.lookup(LookupParams {
        digest: digest_for("/a"),
        req: &req.http,
        xid: req.vxid,
        grace_limit: None,
        hash_ignore_busy: false,
    }) else {
        panic!("expected hit after fetch");
    };
    t.store.deref_oc(&hit);
    t.store.deref_oc(&oc);
}

#[tokio::test]
async fn test_uncacheable_fetch_becomes_hit_for_miss() {
    let backend = MockBackend::new(vec![CannedResp::ok("secret", "private")]);
    let t = test_env(MockDirector::new(backend));

    let oc = fetch_once(&t, "/priv").await;
    let flags = oc.flags();
    assert!(flags.contains(OcFlags::PRIVATE));
    assert!(flags.contains(OcFlags::HFM));
    // The body is still delivered to the requesting client.
    assert_eq!(oc.obj().unwrap().body_bytes().as_ref(), b"secret");

    // The cached decision steers the next lookup into a non-coalescing miss.
    let req = make_req(&t.env, "GET", "/priv", &[]);
    let Lookup::Miss(handle) = t.store.lookup(LookupParams {
        digest: digest_for("/priv"),
        req: &req.http,
        xid: req.vxid,
        grace_limit: None,
        hash_ignore_busy: false,
    }) else {
        panic!("expected hit-for-miss");
    };
    assert!(handle.uncacheable);
    assert!(!handle.coalescing);
    t.store.deref_oc(&oc);
}

#[tokio::test]
async fn test_retry_then_success() {
    let backend = MockBackend::new(vec![CannedResp::ok("ok", "max-age=60")]);
    backend.fail_next(1);
    let t = test_env(MockDirector::new(backend.clone()));

    let oc = fetch_once(&t, "/flaky").await;
    assert_eq!(backend.call_count(), 2);
    assert_eq!(oc.obj().unwrap().attrs().status, 200);
    t.store.deref_oc(&oc);
}

#[tokio::test]
async fn test_exhausted_retries_synthesize_503() {
    let backend = MockBackend::new(vec![CannedResp::ok("never", "max-age=60")]);
    backend.fail_next(100);
    let t = test_env(MockDirector::new(backend.clone()));

    let oc = fetch_once(&t, "/dead").await;
    // max_retries 2: the original dispatch plus two retries.
    assert_eq!(backend.call_count(), 3);
    assert!(oc.boc().is_none());
    let obj = oc.obj().expect("synthetic error object");
    assert_eq!(obj.attrs().status, 503);
    assert!(oc.flags().contains(OcFlags::PRIVATE));
    t.store.deref_oc(&oc);
}

#[tokio::test]
async fn test_abandon_marks_failure_and_wakes_waiters() {
    let backend = MockBackend::new(vec![CannedResp::ok("x", "max-age=60")]);
    // A program whose backend_fetch abandons the transaction outright.
    let program: Arc<VclProgram> = {
        let builtin = builtin_program();
        let mut b = VclProgram::builder("abandoning");
        for name in [
            "vcl_recv",
            "vcl_pipe",
            "vcl_pass",
            "vcl_hash",
            "vcl_purge",
            "vcl_miss",
            "vcl_hit",
            "vcl_deliver",
            "vcl_synth",
            "vcl_backend_response",
            "vcl_backend_error",
        ] {
            let idx = builtin.sub_idx(name).unwrap();
            let sub = builtin.sub(idx).unwrap();
            b = b.define(name, sub.methods, sub.returns, sub.origin.clone(), sub.body.clone());
        }
        b.define(
            "vcl_backend_fetch",
            MethodMask::BACKEND_FETCH,
            ActionMask::ABANDON,
            "test",
            Arc::new(|_ctx: &mut VclCtx<'_>, _p: &VclProgram| Ok(VclAction::Abandon)),
        )
        .build()
        .unwrap()
    };
    let t = common::test_env_with_program(MockDirector::new(backend.clone()), program);

    let req = make_req(&t.env, "GET", "/ab", &[]);
    let Lookup::Miss(handle) = t.store.lookup(LookupParams {
        digest: digest_for("/ab"),
        req: &req.http,
        xid: req.vxid,
        grace_limit: None,
        hash_ignore_busy: false,
    }) else {
        panic!("expected miss");
    };
    let oc = handle.oc.clone();
    oc.take_ref();
    let boc = handle.boc.clone();
    let bereq = fetch::build_bereq(&req.http, None);
    let bo = BusyObj::new(next_vxid(), bereq, handle, &t.env.fetch);
    fetch::run_fetch(t.env.fetch.clone(), bo).await;

    assert_eq!(boc.state(), BocState::Failed);
    assert!(oc.flags().contains(OcFlags::FAILED));
    assert_eq!(backend.call_count(), 0);
    // The failed core left the cache.
    assert_eq!(t.store.object_count(), 0);
    t.store.deref_oc(&oc);
}

#[tokio::test]
async fn test_conditional_refresh_adopts_stale_body() {
    let backend = MockBackend::new(vec![CannedResp::not_modified()]);
    let t = test_env(MockDirector::new(backend.clone()));

    // A keepable stale object with a validator.
    let stale = insert_object(
        &t.store,
        &t.env,
        "/cond",
        200,
        &[("content-type", "text/plain")],
        b"cached body",
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(300),
    );
    stale
        .obj()
        .unwrap()
        .with_attrs(|a| a.etag = Some(b"\"v1\"".to_vec()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let oc = fetch_once(&t, "/cond").await;
    let obj = oc.obj().expect("refreshed object");
    assert_eq!(obj.body_bytes().as_ref(), b"cached body");
    assert_eq!(obj.attrs().status, 200);
    // The 304's freshness applies to the refreshed object.
    assert_eq!(oc.ttl_state().ttl, Duration::from_secs(60));
    // The stale version was superseded.
    assert!(stale.is_dying());
    assert_eq!(backend.call_count(), 1);
    t.store.deref_oc(&oc);
}

#[tokio::test]
async fn test_bereq_construction_strips_hop_by_hop() {
    let mut req = HttpMsg::new_request(b"GET", b"/h", b"HTTP/1.1");
    req.set("host", &b"h"[..]);
    req.set("connection", &b"keep-alive"[..]);
    req.set("transfer-encoding", &b"chunked"[..]);
    req.set("range", &b"bytes=0-1"[..]);
    req.set("x-custom", &b"kept"[..]);

    let bereq = fetch::build_bereq(&req, Some("10.0.0.1".parse().unwrap()));
    assert_eq!(bereq.get_str("connection"), Some("close"));
    assert!(!bereq.has("transfer-encoding"));
    assert!(!bereq.has("range"));
    assert_eq!(bereq.get_str("x-custom"), Some("kept"));
    assert_eq!(bereq.get_str("x-forwarded-for"), Some("10.0.0.1"));
}
