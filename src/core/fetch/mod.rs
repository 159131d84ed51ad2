// src/core/fetch/mod.rs

//! The fetch finite-state machine: one backend transaction populating one
//! busy object.
//!
//! MKBEREQ → STARTFETCH → {RETRY | CONDFETCH | FETCH | ERROR} → {FAIL} →
//! DONE. Retry is only legal before any body byte has been committed to
//! storage. The BOC is published along the way so streaming deliverers can
//! follow the fetch as it happens.

pub mod esi;
pub mod filters;
pub mod freshness;

use crate::core::director::{BackendTimeouts, BackendTxn, Director};
use crate::core::http::{BodyFraming, HttpMsg};
use crate::core::metrics;
use crate::core::objstore::boc::BocState;
use crate::core::objstore::objcore::{OcFlags, OcTtl};
use crate::core::objstore::vary::VaryBuild;
use crate::core::objstore::{MissHandle, ObjStore, vary};
use crate::core::storage::object::ObjAttrs;
use crate::core::storage::stevedore::Stevedore;
use crate::core::vcl::runtime::{FetchSwitches, SynthSpec};
use crate::core::vcl::{self, VclAction, VclMethod, VclProgram};
use crate::core::vsl::{TxnSide, Vsl, VslSink, VslTag, Vxid};
use crate::core::workspace::Workspace;
use bytes::Bytes;
use esi::EsiParser;
use filters::{
    ChunkedReader, EofReader, EsiScanFilter, FetchFilter, FilterChain, FilterPull, GunzipFilter,
    GzipFilter, LengthReader, TestGunzipFilter,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strum_macros::Display;
use tracing::debug;

/// TTL of a cached bypass decision (hit-for-miss / hit-for-pass).
const DECISION_TTL: Duration = Duration::from_secs(120);

/// The fetch FSM steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStep {
    MkBereq,
    StartFetch,
    Retry,
    CondFetch,
    Fetch,
    Error,
    Fail,
    Done,
}

/// Everything the fetch FSM needs from its surroundings. Tests assemble one
/// around a mock director.
#[derive(Clone, Debug)]
pub struct FetchEnv {
    pub store: Arc<ObjStore>,
    pub director: Arc<dyn Director>,
    pub program: Arc<VclProgram>,
    pub defaults: freshness::FreshnessDefaults,
    pub timeouts: BackendTimeouts,
    pub max_retries: u32,
    /// Objects with less effective life than this go to transient storage.
    pub shortlived: Duration,
    pub gzip_enabled: bool,
    pub gzip_level: u32,
    /// Fetch workspace size.
    pub workspace_backend: usize,
    pub vsl: VslSink,
}

/// The busy object: state of one fetch in flight.
pub struct BusyObj {
    pub vxid: Vxid,
    pub ws: Workspace,
    pub bereq: HttpMsg,
    pub beresp: Option<HttpMsg>,
    /// Client request body to forward, already collected.
    pub req_body: Option<Bytes>,
    pub handle: MissHandle,
    pub switches: FetchSwitches,
    pub was_304: bool,
    pub is_bgfetch: bool,
    retries: u32,
    vsl: Vsl,
    txn: Option<BackendTxn>,
    /// Bytes committed to storage; retry is illegal once nonzero.
    committed: u64,
}

impl BusyObj {
    pub fn new(vxid: Vxid, bereq: HttpMsg, handle: MissHandle, env: &FetchEnv) -> Self {
        let vsl = Vsl::new(vxid, TxnSide::Backend, env.vsl.clone());
        Self {
            vxid,
            ws: Workspace::new("bo", env.workspace_backend),
            bereq,
            beresp: None,
            req_body: None,
            handle,
            switches: FetchSwitches {
                do_stream: true,
                ..Default::default()
            },
            was_304: false,
            is_bgfetch: false,
            retries: 0,
            vsl,
            txn: None,
            committed: 0,
        }
    }
}

/// Derives the backend request from a client request: hop-by-hop headers go,
/// identity headers come.
pub fn build_bereq(req: &HttpMsg, peer: Option<std::net::IpAddr>) -> HttpMsg {
    let mut bereq = HttpMsg::new_request(&req.method, &req.url, b"HTTP/1.1");
    for (n, v) in &req.headers {
        if n.eq_ignore_ascii_case(b"connection")
            || n.eq_ignore_ascii_case(b"keep-alive")
            || n.eq_ignore_ascii_case(b"transfer-encoding")
            || n.eq_ignore_ascii_case(b"upgrade")
            || n.eq_ignore_ascii_case(b"range")
        {
            continue;
        }
        bereq.headers.push((n.clone(), v.clone()));
    }
    if let Some(ip) = peer {
        match req.get("x-forwarded-for").cloned() {
            Some(existing) => {
                let mut v = existing.to_vec();
                v.extend_from_slice(b", ");
                v.extend_from_slice(ip.to_string().as_bytes());
                bereq.replace("x-forwarded-for", Bytes::from(v));
            }
            None => bereq.set("x-forwarded-for", ip.to_string().into_bytes()),
        }
    }
    bereq.replace("connection", &b"close"[..]);
    bereq
}

/// Runs the fetch FSM to completion. The task owns the fetcher's reference
/// on the busy object core and drops it at DONE.
pub async fn run_fetch(env: FetchEnv, mut bo: BusyObj) {
    metrics::FETCHES_TOTAL.inc();
    metrics::FETCHES_IN_FLIGHT.inc();
    bo.vsl.logf(VslTag::Begin, format!("bereq {}", bo.vxid));
    bo.vsl.log(VslTag::BereqMethod, bo.bereq.method.clone());
    bo.vsl.log(VslTag::BereqUrl, bo.bereq.url.clone());

    let mut step = FetchStep::MkBereq;
    loop {
        debug!(vxid = bo.vxid, step = %step, "fetch step");
        step = match step {
            FetchStep::MkBereq => mkbereq(&env, &mut bo),
            FetchStep::StartFetch => startfetch(&env, &mut bo).await,
            FetchStep::Retry => retry(&env, &mut bo),
            FetchStep::CondFetch => condfetch(&env, &mut bo),
            FetchStep::Fetch => fetch_body(&env, &mut bo).await,
            FetchStep::Error => error_synth(&env, &mut bo),
            FetchStep::Fail => fail(&env, &mut bo),
            FetchStep::Done => break,
        };
    }

    // boc_done: the fetch no longer owns the object context.
    bo.handle.oc.clear_boc();
    if let Some(stale) = bo.handle.stale.take() {
        env.store.deref_oc(&stale);
    }
    if bo.handle.oc.objhead().is_none() && !bo.handle.oc.is_dying() {
        // Never linked into a bucket: nothing else will drop the cache's
        // reference on this private object.
        env.store.deref_oc(&bo.handle.oc);
    }
    env.store.deref_oc(&bo.handle.oc);
    bo.vsl.log(VslTag::End, Bytes::new());
    bo.vsl.flush();
    metrics::FETCHES_IN_FLIGHT.dec();
}

fn mkbereq(env: &FetchEnv, bo: &mut BusyObj) -> FetchStep {
    let now = SystemTime::now();
    if env.gzip_enabled {
        bo.bereq.replace("accept-encoding", &b"gzip"[..]);
    }
    let mut ctx = vcl::VclCtx::new(VclMethod::BackendFetch, now)
        .with_vsl(&mut bo.vsl)
        .with_bereq(&mut bo.bereq);
    match vcl::dispatch(&env.program, &mut ctx, VclMethod::BackendFetch) {
        Ok(VclAction::Fetch) => {}
        Ok(VclAction::Abandon) | Ok(_) => return FetchStep::Fail,
        Err(e) => {
            bo.vsl.logf(VslTag::Error, format!("backend_fetch: {e}"));
            return FetchStep::Fail;
        }
    }
    // A stale object with validators makes this a conditional fetch.
    if let Some(stale) = &bo.handle.stale
        && let Some(obj) = stale.obj()
    {
        let attrs = obj.attrs();
        if let Some(etag) = &attrs.etag {
            bo.bereq.replace("if-none-match", Bytes::copy_from_slice(etag));
        } else if let Some(lm) = &attrs.last_modified {
            bo.bereq
                .replace("if-modified-since", Bytes::copy_from_slice(lm));
        }
    }
    FetchStep::StartFetch
}

async fn startfetch(env: &FetchEnv, bo: &mut BusyObj) -> FetchStep {
    let backend = match env.director.resolve().await {
        Ok(b) => b,
        Err(e) => {
            bo.vsl.logf(VslTag::FetchError, format!("no backend: {e}"));
            return FetchStep::Retry;
        }
    };
    bo.vsl.logf(VslTag::BackendOpen, backend.name().to_string());
    let txn = match backend
        .gethdrs(&bo.bereq, bo.req_body.clone(), &env.timeouts)
        .await
    {
        Ok(txn) => txn,
        Err(e) => {
            bo.vsl.logf(VslTag::FetchError, e.to_string());
            return FetchStep::Retry;
        }
    };

    let now = SystemTime::now();
    let mut beresp = txn.beresp.clone();
    bo.vsl
        .logf(VslTag::BerespStatus, beresp.status.to_string());

    bo.was_304 = beresp.status == 304 && bo.handle.stale.is_some();
    let decision = freshness::decide(&beresp, now, env.defaults);
    let mut ttl_state = decision.ttl_state;
    bo.switches.uncacheable |= !decision.cacheable || bo.handle.uncacheable;

    let action = {
        let mut ctx = vcl::VclCtx::new(VclMethod::BackendResponse, now)
            .with_vsl(&mut bo.vsl)
            .with_bereq(&mut bo.bereq)
            .with_beresp(&mut beresp)
            .with_ttl(&mut ttl_state)
            .with_fetch_switches(&mut bo.switches);
        vcl::dispatch(&env.program, &mut ctx, VclMethod::BackendResponse)
    };

    bo.handle.oc.set_ttl_state(ttl_state);
    bo.beresp = Some(beresp);
    bo.txn = Some(txn);

    match action {
        Ok(VclAction::Deliver) => {
            bo.vsl.logf(
                VslTag::TtlSet,
                format!(
                    "ttl={:?} grace={:?} keep={:?}",
                    ttl_state.ttl, ttl_state.grace, ttl_state.keep
                ),
            );
            publish_req_done(bo);
            if bo.was_304 {
                FetchStep::CondFetch
            } else {
                FetchStep::Fetch
            }
        }
        Ok(VclAction::Retry) => FetchStep::Retry,
        Ok(VclAction::Pass) => {
            // Cache the decision to bypass: hit-for-pass.
            bo.handle.oc.set_flags(OcFlags::HFP);
            bo.handle.oc.set_ttl_state(OcTtl {
                t_origin: now,
                ttl: DECISION_TTL,
                grace: Duration::ZERO,
                keep: Duration::ZERO,
            });
            bo.switches.uncacheable = true;
            publish_req_done(bo);
            FetchStep::Fetch
        }
        Ok(VclAction::Error) => FetchStep::Error,
        Ok(VclAction::Abandon) | Ok(_) => FetchStep::Fail,
        Err(e) => {
            bo.vsl
                .logf(VslTag::Error, format!("backend_response: {e}"));
            FetchStep::Fail
        }
    }
}

fn publish_req_done(bo: &BusyObj) {
    if bo.switches.do_esi || !bo.switches.do_stream {
        // Deliverers must not stream a body still being parsed.
        bo.handle.boc.set_streamable(false);
    }
    bo.handle.boc.set_state(BocState::ReqDone);
}

fn retry(env: &FetchEnv, bo: &mut BusyObj) -> FetchStep {
    bo.txn = None;
    if bo.committed > 0 {
        // Body bytes have been committed; the transaction cannot be redone.
        return FetchStep::Error;
    }
    bo.retries += 1;
    if bo.retries > env.max_retries {
        return FetchStep::Error;
    }
    metrics::FETCH_RETRIES_TOTAL.inc();
    FetchStep::StartFetch
}

/// 304 refresh: adopt the stale object's body and headers, with freshness
/// taken from the conditional response.
fn condfetch(env: &FetchEnv, bo: &mut BusyObj) -> FetchStep {
    metrics::COND_REFRESH_TOTAL.inc();
    let stale = bo.handle.stale.as_ref().expect("condfetch without stale");
    let Some(stale_obj) = stale.obj() else {
        return FetchStep::Fail;
    };
    let beresp = bo.beresp.as_ref().expect("condfetch without beresp");

    let stv = env.store.stevedores.select(is_shortlived(env, bo));
    let obj = match stv.alloc_obj() {
        Ok(o) => o,
        Err(_) => return FetchStep::Fail,
    };

    let mut attrs = stale_obj.attrs();
    // 304 headers refresh the stored ones they name.
    let mut stored = match crate::core::http::decode_headers(&attrs.headers) {
        Ok(h) => h,
        Err(_) => return FetchStep::Fail,
    };
    for (n, v) in &beresp.headers {
        if n.eq_ignore_ascii_case(b"content-length") || n.eq_ignore_ascii_case(b"connection") {
            continue;
        }
        stored.retain(|(sn, _)| !sn.eq_ignore_ascii_case(n));
        stored.push((n.clone(), v.clone()));
    }
    attrs.headers = crate::core::http::encode_headers(&stored);
    attrs.xid = bo.vxid;

    let body = stale_obj.segments();
    let len: u64 = body.iter().map(|s| s.len() as u64).sum();
    if stv.charge(len).is_err() && !free_space(env, &stv, len) {
        return FetchStep::Fail;
    }
    obj.adopt_body(body);
    attrs.len = len;
    obj.set_attrs(attrs);
    bo.handle.oc.set_obj(obj, stv);
    bo.handle.boc.set_vary(stale.vary());

    finalize(env, bo);
    FetchStep::Done
}

fn is_shortlived(env: &FetchEnv, bo: &BusyObj) -> bool {
    let t = bo.handle.oc.ttl_state();
    bo.switches.uncacheable || t.ttl + t.grace + t.keep < env.shortlived
}

/// Tries to nuke LRU objects until `need` bytes fit.
fn free_space(
    env: &FetchEnv,
    stv: &Arc<crate::core::storage::stevedore::MallocStevedore>,
    need: u64,
) -> bool {
    for _ in 0..16 {
        if !env.store.nuke_one(stv.as_ref()) {
            return false;
        }
        if stv.charge(need).is_ok() {
            return true;
        }
    }
    false
}

async fn fetch_body(env: &FetchEnv, bo: &mut BusyObj) -> FetchStep {
    let beresp = bo.beresp.clone().expect("fetch without beresp");
    let Some(txn) = bo.txn.take() else {
        return FetchStep::Fail;
    };

    let stv = env.store.stevedores.select(is_shortlived(env, bo));
    let obj = match stv.alloc_obj() {
        Ok(o) => o,
        Err(_) => return FetchStep::Fail,
    };

    let gzipped_in = beresp
        .get_str("content-encoding")
        .is_some_and(|ce| ce.eq_ignore_ascii_case("gzip"));

    // Bottom-up: protocol reader, content codings, ESI scan.
    let source: Box<dyn FetchFilter> = match txn.framing {
        BodyFraming::None => Box::new(LengthReader::new(txn.body, 0)),
        BodyFraming::Length(n) => Box::new(LengthReader::new(txn.body, n)),
        BodyFraming::Chunked => Box::new(ChunkedReader::new(txn.body)),
        BodyFraming::Eof => Box::new(EofReader::new(txn.body)),
        BodyFraming::Error => {
            bo.vsl
                .log(VslTag::FetchError, &b"unparseable body framing"[..]);
            return FetchStep::Fail;
        }
    };
    if bo.switches.do_esi && gzipped_in {
        // ESI scans the plain body; gunzip below the scanner.
        bo.switches.do_gunzip = true;
    }
    let do_gunzip = bo.switches.do_gunzip && gzipped_in;
    let do_gzip = bo.switches.do_gzip && !gzipped_in && !do_gunzip && env.gzip_enabled;
    let mut top = source;
    let mut gzipped_out = gzipped_in;
    if do_gunzip {
        top = Box::new(GunzipFilter::new(top));
        gzipped_out = false;
        bo.vsl.log(VslTag::Gzip, &b"gunzip"[..]);
    } else if gzipped_in {
        top = Box::new(TestGunzipFilter::new(top));
        bo.vsl.log(VslTag::Gzip, &b"testgunzip"[..]);
    }
    if do_gzip {
        top = Box::new(GzipFilter::new(top, env.gzip_level));
        gzipped_out = true;
        bo.vsl.log(VslTag::Gzip, &b"gzip"[..]);
    }
    let esi_parser = if bo.switches.do_esi && !gzipped_out {
        let parser = Arc::new(Mutex::new(EsiParser::new()));
        top = Box::new(EsiScanFilter::new(top, parser.clone()));
        Some(parser)
    } else {
        None
    };
    let mut chain = FilterChain::new(top);

    // Attributes go in before streaming so deliverers can read them at
    // REQ_DONE.
    let body_transformed = do_gunzip || do_gzip;
    obj.set_attrs(build_attrs(bo, &beresp, gzipped_out, body_transformed));
    bo.handle.oc.set_obj(obj.clone(), stv.clone());

    match vary::build(&beresp, &bo.bereq) {
        Ok(VaryBuild::Desc(desc)) => bo.handle.boc.set_vary(Some(desc)),
        Ok(VaryBuild::None) => {}
        Ok(VaryBuild::Star) => bo.switches.uncacheable = true,
        Err(e) => {
            bo.vsl.logf(VslTag::Error, format!("vary: {e}"));
            return FetchStep::Fail;
        }
    }

    apply_decision_flags(bo);
    bo.handle.boc.set_state(BocState::PrepStream);
    if bo.switches.do_stream && esi_parser.is_none() {
        // Streaming: deliverers may start before the body is complete.
        env.store.unbusy(&bo.handle);
        if !bo.handle.coalescing && !bo.switches.uncacheable {
            env.store.link_fetched(&bo.handle);
        }
    }
    bo.handle.boc.set_state(BocState::Stream);

    loop {
        match chain.pull().await {
            Ok(FilterPull::Data(data)) => {
                let n = data.len() as u64;
                if stv.charge(n).is_err() && !free_space(env, &stv, n) {
                    bo.vsl.log(VslTag::FetchError, &b"storage exhausted"[..]);
                    return FetchStep::Fail;
                }
                obj.append(data);
                bo.committed += n;
                bo.handle.boc.extend_len(n);
            }
            Ok(FilterPull::End) => break,
            Err(e) => {
                bo.vsl.logf(VslTag::FetchError, e.to_string());
                return FetchStep::Fail;
            }
        }
    }

    let len = obj.get_len();
    obj.with_attrs(|attrs| {
        attrs.len = len;
        if let Some(parser) = &esi_parser {
            let mut parser = parser.lock();
            if parser.has_includes() {
                let segs = parser.take_segments();
                attrs.esi = esi::encode_segments(&segs).ok();
            }
        }
    });
    bo.vsl.logf(VslTag::FetchBody, format!("{len} bytes"));

    finalize(env, bo);
    FetchStep::Done
}

/// Marks the decision flags for uncacheable outcomes before the object
/// becomes visible.
fn apply_decision_flags(bo: &mut BusyObj) {
    if bo.switches.uncacheable && !bo.handle.oc.flags().contains(OcFlags::HFP) {
        bo.handle.oc.set_flags(OcFlags::PRIVATE);
        if bo.handle.coalescing {
            // The linked placeholder becomes a hit-for-miss marker.
            bo.handle.oc.set_flags(OcFlags::HFM);
            bo.handle.oc.set_ttl_state(OcTtl {
                t_origin: SystemTime::now(),
                ttl: DECISION_TTL,
                grace: Duration::ZERO,
                keep: Duration::ZERO,
            });
        }
    }
}

/// Completes a successful fetch: attributes final, object visible, BOC
/// finished.
fn finalize(env: &FetchEnv, bo: &mut BusyObj) {
    if !bo.switches.do_stream {
        env.store.unbusy(&bo.handle);
        if !bo.handle.coalescing && !bo.switches.uncacheable {
            env.store.link_fetched(&bo.handle);
        }
    } else if bo.handle.oc.is_busy() {
        // Streaming fetches unbusy at PREP_STREAM; cover the condfetch path.
        env.store.unbusy(&bo.handle);
    }
    // The replacement supersedes the stale object it refreshed.
    if let Some(stale) = &bo.handle.stale
        && !bo.switches.uncacheable
    {
        env.store.kill(stale);
    }
    bo.handle.boc.set_state(BocState::Finished);
}

fn build_attrs(bo: &BusyObj, beresp: &HttpMsg, gzipped: bool, transformed: bool) -> ObjAttrs {
    let mut stored: Vec<(Bytes, Bytes)> = Vec::new();
    for (n, v) in &beresp.headers {
        if n.eq_ignore_ascii_case(b"connection")
            || n.eq_ignore_ascii_case(b"keep-alive")
            || n.eq_ignore_ascii_case(b"transfer-encoding")
        {
            continue;
        }
        if transformed
            && (n.eq_ignore_ascii_case(b"content-length")
                || n.eq_ignore_ascii_case(b"content-encoding"))
        {
            continue;
        }
        stored.push((n.clone(), v.clone()));
    }
    if transformed && gzipped {
        stored.push((
            Bytes::from_static(b"Content-Encoding"),
            Bytes::from_static(b"gzip"),
        ));
    }
    ObjAttrs {
        status: beresp.status,
        reason: beresp.reason.to_vec(),
        proto: beresp.proto.to_vec(),
        headers: crate::core::http::encode_headers(&stored),
        vary: bo.handle.boc.vary().map(|v| v.to_vec()),
        flags: 0,
        len: 0,
        xid: bo.vxid,
        esi: None,
        gzipped,
        etag: beresp.get("etag").map(|v| v.to_vec()),
        last_modified: beresp.get("last-modified").map(|v| v.to_vec()),
    }
}

/// Synthesizes a backend error object so deliverers get a 503.
fn error_synth(env: &FetchEnv, bo: &mut BusyObj) -> FetchStep {
    let now = SystemTime::now();
    let mut beresp = HttpMsg::new_response(b"HTTP/1.1", 503, b"Backend fetch failed");
    beresp.set("content-type", &b"text/html; charset=utf-8"[..]);
    beresp.set(
        "date",
        freshness::format_http_date(now).into_bytes(),
    );

    let mut synth = SynthSpec {
        status: 503,
        reason: "Backend fetch failed".to_string(),
        body: Vec::new(),
    };
    let action = {
        let mut ctx = vcl::VclCtx::new(VclMethod::BackendError, now)
            .with_vsl(&mut bo.vsl)
            .with_bereq(&mut bo.bereq)
            .with_beresp(&mut beresp)
            .with_synth(&mut synth);
        vcl::dispatch(&env.program, &mut ctx, VclMethod::BackendError)
    };
    match action {
        Ok(VclAction::Deliver) => {}
        Ok(VclAction::Retry) => return FetchStep::Retry,
        Ok(VclAction::Abandon) | Ok(_) => return FetchStep::Fail,
        Err(e) => {
            bo.vsl.logf(VslTag::Error, format!("backend_error: {e}"));
            return FetchStep::Fail;
        }
    }
    if synth.body.is_empty() {
        synth.body = crate::core::req::synth::default_error_body(
            beresp.status,
            std::str::from_utf8(&beresp.reason).unwrap_or("Error"),
            bo.vxid,
        );
    }

    let stv = env.store.stevedores.transient.clone();
    let obj = match stv.alloc_obj() {
        Ok(o) => o,
        Err(_) => return FetchStep::Fail,
    };
    let len = synth.body.len() as u64;
    if stv.charge(len).is_err() {
        return FetchStep::Fail;
    }
    bo.switches.uncacheable = true;
    bo.handle.oc.set_flags(OcFlags::PRIVATE);
    bo.handle.oc.set_ttl_state(OcTtl {
        t_origin: now,
        ttl: Duration::ZERO,
        grace: Duration::ZERO,
        keep: Duration::ZERO,
    });
    bo.beresp = Some(beresp.clone());
    obj.set_attrs(build_attrs(bo, &beresp, false, false));
    obj.append(Bytes::from(synth.body));
    obj.with_attrs(|a| a.len = len);
    bo.handle.oc.set_obj(obj, stv);

    metrics::SYNTH_RESPONSES_TOTAL.inc();
    env.store.unbusy(&bo.handle);
    bo.handle.boc.set_state(BocState::Finished);
    FetchStep::Done
}

/// Terminal failure: mark the core failed, wake everyone, drop the object
/// from the cache.
fn fail(env: &FetchEnv, bo: &mut BusyObj) -> FetchStep {
    metrics::FETCH_FAILURES_TOTAL.inc();
    bo.handle.oc.set_flags(OcFlags::FAILED);
    bo.handle.boc.fail();
    env.store.unbusy(&bo.handle);
    env.store.kill(&bo.handle.oc);
    FetchStep::Done
}
