mod common;

use citrine::core::ban::{BanEngine, BanVerdict};
use citrine::core::http::HttpMsg;
use citrine::core::objstore::{Lookup, LookupParams};
use common::{MockBackend, MockDirector, digest_for, insert_object, make_req, test_env};
use std::time::Duration;

fn engine_env() -> common::TestEnv {
    let backend = MockBackend::new(vec![common::CannedResp::ok("x", "max-age=60")]);
    test_env(MockDirector::new(backend))
}

#[test]
fn test_ban_spec_parsing() {
    let bans = BanEngine::new();
    assert!(bans.add_spec("obj.status == 500").is_ok());
    assert!(bans.add_spec("req.url ~ ^/api/ && obj.http.x-kind != page").is_ok());
    assert!(bans.add_spec("").is_err());
    assert!(bans.add_spec("obj.status").is_err());
    assert!(bans.add_spec("obj.status <> 200").is_err());
    assert!(bans.add_spec("nonsense == 1").is_err());
    assert!(bans.add_spec("req.url ~ ((bad").is_err());
}

#[test]
fn test_ban_list_is_append_only_from_the_front() {
    let bans = BanEngine::new();
    let b1 = bans.add_spec("obj.status == 500").unwrap();
    let b2 = bans.add_spec("obj.status == 404").unwrap();
    assert!(b2.seq > b1.seq);
    assert_eq!(bans.head().seq, b2.seq);
}

#[tokio::test]
async fn test_ban_match_drops_object_at_lookup() {
    let t = engine_env();
    insert_object(
        &t.store,
        &t.env,
        "/banned",
        500,
        &[],
        b"oops",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    t.bans.add_spec("obj.status == 500").unwrap();

    let req = make_req(&t.env, "GET", "/banned", &[]);
    let lookup = t.store.lookup(LookupParams {
        digest: digest_for("/banned"),
        req: &req.http,
        xid: 1,
        grace_limit: None,
        hash_ignore_busy: false,
    });
    // The banned object is gone; the lookup becomes a miss.
    assert!(matches!(lookup, Lookup::Miss(_)));
}

#[tokio::test]
async fn test_ban_survivor_advances_pointer_to_head() {
    let t = engine_env();
    let oc = insert_object(
        &t.store,
        &t.env,
        "/ok",
        200,
        &[],
        b"fine",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    let ban = t.bans.add_spec("obj.status == 500").unwrap();

    let req = HttpMsg::new_request(b"GET", b"/ok", b"HTTP/1.1");
    assert_eq!(t.bans.check_oc(&oc, Some(&req)), BanVerdict::Clean);
    assert_eq!(oc.ban_ref().unwrap().seq, ban.seq);

    // A second check walks nothing.
    assert_eq!(t.bans.check_oc(&oc, Some(&req)), BanVerdict::Clean);
}

#[tokio::test]
async fn test_req_touching_ban_deferred_without_request() {
    let t = engine_env();
    let oc = insert_object(
        &t.store,
        &t.env,
        "/page",
        200,
        &[],
        b"x",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    t.bans.add_spec("req.url ~ ^/page").unwrap();

    // The lurker has no request, so the verdict is deferred.
    assert_eq!(t.bans.check_oc(&oc, None), BanVerdict::Deferred);

    // At lookup time the request makes it evaluable.
    let req = HttpMsg::new_request(b"GET", b"/page", b"HTTP/1.1");
    assert_eq!(t.bans.check_oc(&oc, Some(&req)), BanVerdict::Hit);
}

#[tokio::test]
async fn test_lurker_sweep_completes_obj_only_bans() {
    let t = engine_env();
    let survivor = insert_object(
        &t.store,
        &t.env,
        "/a",
        200,
        &[],
        b"a",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    insert_object(
        &t.store,
        &t.env,
        "/b",
        500,
        &[],
        b"b",
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::ZERO,
    );
    let ban = t.bans.add_spec("obj.status == 500").unwrap();

    // Hand-rolled lurker sweep over the store.
    let mut kills = Vec::new();
    t.store.for_each_oc(|oc| match t.bans.check_oc(oc, None) {
        BanVerdict::Hit => kills.push(oc.clone()),
        _ => {}
    });
    for oc in &kills {
        t.store.kill(oc);
    }
    assert_eq!(kills.len(), 1);

    // The survivor's pointer is at the head; the ban completes and the
    // completed tail shrinks away.
    assert_eq!(survivor.ban_ref().unwrap().seq, ban.seq);
    t.bans.sweep_completed(ban.seq);
    assert!(ban.completed());
    assert_eq!(t.store.object_count(), 1);
}
