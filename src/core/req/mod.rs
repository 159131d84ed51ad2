// src/core/req/mod.rs

//! The request finite-state machine: one client transaction.
//!
//! RECV → LOOKUP → {HIT → DELIVER | WAIT → LOOKUP | MISS → FETCH → DELIVER}
//! with PASS, PIPE, PURGE, SYNTH and RESTART branches picked by the
//! directive program. A request parked behind a busy object holds no worker;
//! its continuation is a oneshot waker on the object head's waiting list.

pub mod deliver;
pub mod synth;

use crate::connection::session::{Session, StreamClose};
use crate::core::CitrineError;
use crate::core::fetch::{self, BusyObj, FetchEnv};
use crate::core::http::HttpMsg;
use crate::core::metrics;
use crate::core::objstore::boc::{Boc, BocState};
use crate::core::objstore::objcore::ObjCore;
use crate::core::objstore::{HashAccum, Lookup, LookupParams, MissHandle};
use crate::core::vcl::runtime::{ReqSwitches, SynthSpec};
use crate::core::vcl::{self, VclAction, VclMethod};
use crate::core::vcl::privs::TaskPrivs;
use crate::core::vsl::{TxnSide, Vsl, VslTag, Vxid, next_vxid};
use crate::core::workspace::Workspace;
use bytes::Bytes;
use deliver::DeliverySink;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::Display;
use tracing::debug;

/// The request FSM steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReqStep {
    Restart,
    Recv,
    Pipe,
    Pass,
    Lookup,
    Purge,
    Miss,
    Fetch,
    Deliver,
    Synth,
    Done,
}

/// Everything the request FSM needs from its surroundings.
#[derive(Clone, Debug)]
pub struct ReqEnv {
    pub fetch: FetchEnv,
    pub max_restarts: u32,
    pub max_esi_depth: u32,
    pub range_support: bool,
    /// Deadline for one blocking step (parked lookup, BOC header wait).
    pub timeout_req: Duration,
    /// Deadline for one streaming-delivery wait on the BOC.
    pub between_bytes: Duration,
    /// Request workspace size.
    pub workspace_client: usize,
}

/// How a finished request leaves the FSM.
#[derive(Debug)]
pub enum ReqOutcome {
    /// Transaction complete; the session may carry another request.
    Done,
    /// Tie the client socket to the backend; terminal for the session.
    Pipe { bereq: HttpMsg },
}

/// One client transaction.
pub struct Req {
    pub vxid: Vxid,
    pub esi_level: u32,
    pub restarts: u32,
    pub ws: Workspace,
    /// The request as directives see (and may edit) it.
    pub http: HttpMsg,
    /// The pristine request, restored on restart.
    pub http0: HttpMsg,
    pub body: Option<Bytes>,
    pub sess: Arc<Session>,
    pub switches: ReqSwitches,
    pub privs: TaskPrivs,
    pub vsl: Vsl,
    /// The object picked for delivery.
    pub objcore: Option<Arc<ObjCore>>,
    pub boc: Option<Arc<Boc>>,
    pub graced: bool,
    /// Pending synthetic response parameters.
    pub synth: SynthSpec,
    /// The backend request vcl_pipe prepared, consumed by the PIPE step.
    pipe_bereq: Option<HttpMsg>,
    pub t_start: Instant,
    /// Body bytes sent to the client.
    pub acct_body_out: u64,
    step: ReqStep,
}

impl Req {
    pub fn new(sess: Arc<Session>, http: HttpMsg, body: Option<Bytes>, env: &ReqEnv) -> Self {
        let vxid = next_vxid();
        let vsl = Vsl::new(vxid, TxnSide::Client, env.fetch.vsl.clone());
        Self {
            vxid,
            esi_level: 0,
            restarts: 0,
            ws: Workspace::new("req", env.workspace_client),
            http0: http.clone(),
            http,
            body,
            sess,
            switches: ReqSwitches::default(),
            privs: TaskPrivs::new(),
            vsl,
            objcore: None,
            boc: None,
            graced: false,
            synth: SynthSpec::default(),
            pipe_bereq: None,
            t_start: Instant::now(),
            acct_body_out: 0,
            step: ReqStep::Recv,
        }
    }

    fn drop_obj(&mut self, env: &ReqEnv) {
        if let Some(oc) = self.objcore.take() {
            env.fetch.store.deref_oc(&oc);
        }
        self.boc = None;
        self.graced = false;
    }

    /// Queues a synthetic response and moves to SYNTH.
    fn to_synth(&mut self, status: u16, reason: &str) -> ReqStep {
        self.synth = SynthSpec {
            status,
            reason: reason.to_string(),
            body: Vec::new(),
        };
        ReqStep::Synth
    }
}

/// Abandons a miss the request will not fetch: waiters are woken and the
/// placeholder leaves the cache.
fn abandon_miss(env: &ReqEnv, handle: MissHandle) {
    handle.boc.fail();
    handle
        .oc
        .set_flags(crate::core::objstore::objcore::OcFlags::FAILED);
    env.fetch.store.unbusy(&handle);
    env.fetch.store.kill(&handle.oc);
    if let Some(stale) = &handle.stale {
        env.fetch.store.deref_oc(stale);
    }
    env.fetch.store.deref_oc(&handle.oc);
}

/// Spawns the fetch task for a miss, leaving the deliverer's references on
/// the request.
fn start_fetch_task(env: &ReqEnv, req: &mut Req, handle: MissHandle, is_bgfetch: bool) {
    // The deliverer keeps its own handle on the object and its context.
    if !is_bgfetch {
        handle.oc.take_ref();
        req.objcore = Some(handle.oc.clone());
        req.boc = Some(handle.boc.clone());
    }
    let bxid = next_vxid();
    req.vsl.logf(VslTag::Link, format!("bereq {bxid}"));
    let mut bo = BusyObj::new(bxid, fetch::build_bereq(&req.http, Some(req.sess.peer_addr.ip())), handle, &env.fetch);
    bo.req_body = req.body.clone();
    bo.is_bgfetch = is_bgfetch;
    let fetch_env = env.fetch.clone();
    tokio::spawn(async move {
        fetch::run_fetch(fetch_env, bo).await;
    });
}

/// Runs the request FSM to completion against a delivery sink.
pub async fn run_req(
    env: &ReqEnv,
    req: &mut Req,
    sink: &mut dyn DeliverySink,
) -> Result<ReqOutcome, CitrineError> {
    metrics::REQUESTS_TOTAL.inc();
    req.vsl.logf(VslTag::Begin, format!("req {}", req.vxid));
    req.vsl.log(VslTag::ReqMethod, req.http.method.clone());
    req.vsl.log(VslTag::ReqUrl, req.http.url.clone());
    req.vsl.log(VslTag::ReqProtocol, req.http.proto.clone());

    let outcome = run_steps(env, req, sink).await;

    req.drop_obj(env);
    req.vsl.logf(
        VslTag::ReqAcct,
        format!("body_out={}", req.acct_body_out),
    );
    req.vsl.log(VslTag::End, Bytes::new());
    req.vsl.flush();
    metrics::REQUEST_LATENCY_SECONDS.observe(req.t_start.elapsed().as_secs_f64());
    outcome
}

async fn run_steps(
    env: &ReqEnv,
    req: &mut Req,
    sink: &mut dyn DeliverySink,
) -> Result<ReqOutcome, CitrineError> {
    loop {
        debug!(vxid = req.vxid, step = %req.step, "request step");
        req.step = match req.step {
            ReqStep::Restart => step_restart(env, req),
            ReqStep::Recv => step_recv(env, req)?,
            ReqStep::Pipe => {
                let bereq = req.pipe_bereq.take().unwrap_or_else(|| {
                    fetch::build_bereq(&req.http, Some(req.sess.peer_addr.ip()))
                });
                req.sess.close(StreamClose::TxPipe);
                req.vsl.log(VslTag::Pipe, Bytes::new());
                return Ok(ReqOutcome::Pipe { bereq });
            }
            ReqStep::Pass => step_pass(env, req)?,
            ReqStep::Lookup => step_lookup(env, req).await?,
            ReqStep::Purge => step_purge(env, req)?,
            ReqStep::Miss => unreachable!("MISS is folded into LOOKUP"),
            ReqStep::Fetch => step_fetch(env, req).await?,
            ReqStep::Deliver => deliver::step_deliver(env, req, sink).await?,
            ReqStep::Synth => synth::step_synth(env, req, sink).await?,
            ReqStep::Done => return Ok(ReqOutcome::Done),
        };
    }
}

fn step_restart(env: &ReqEnv, req: &mut Req) -> ReqStep {
    req.drop_obj(env);
    if req.restarts >= env.max_restarts {
        return req.to_synth(503, "exceeded max restarts");
    }
    req.restarts += 1;
    // Per-attempt state resets; the restart counter does not.
    req.http = req.http0.clone();
    req.switches = ReqSwitches::default();
    req.synth = SynthSpec::default();
    req.vsl.logf(VslTag::Timestamp, format!("Restart {}", req.restarts));
    ReqStep::Recv
}

fn step_recv(env: &ReqEnv, req: &mut Req) -> Result<ReqStep, CitrineError> {
    let now = std::time::SystemTime::now();
    let action = {
        let mut ctx = vcl::VclCtx::new(VclMethod::Recv, now)
            .with_vsl(&mut req.vsl)
            .with_req(&mut req.http)
            .with_req_switches(&mut req.switches)
            .with_synth(&mut req.synth)
            .with_privs(&mut req.privs);
        vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Recv)
    };
    Ok(match action {
        Ok(VclAction::Lookup) => ReqStep::Lookup,
        Ok(VclAction::Pass) => ReqStep::Pass,
        Ok(VclAction::Pipe) => {
            // vcl_pipe may still edit the backend request.
            let mut bereq = fetch::build_bereq(&req.http, Some(req.sess.peer_addr.ip()));
            let action = {
                let mut ctx = vcl::VclCtx::new(VclMethod::Pipe, now)
                    .with_vsl(&mut req.vsl)
                    .with_bereq(&mut bereq);
                vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Pipe)
            };
            match action {
                Ok(VclAction::Pipe) => {
                    req.pipe_bereq = Some(bereq);
                    ReqStep::Pipe
                }
                Ok(VclAction::Synth) => ReqStep::Synth,
                Ok(_) | Err(_) => {
                    req.sess.close(StreamClose::VclFailure);
                    req.to_synth(503, "Directive failure")
                }
            }
        }
        Ok(VclAction::Purge) => ReqStep::Purge,
        Ok(VclAction::Synth) => {
            if req.synth.status == 0 {
                req.synth.status = 503;
                req.synth.reason = "Service Unavailable".into();
            }
            ReqStep::Synth
        }
        Ok(VclAction::Restart) => ReqStep::Restart,
        Ok(_) => {
            req.sess.close(StreamClose::VclFailure);
            req.to_synth(503, "Directive failure")
        }
        Err(e) => {
            req.vsl.logf(VslTag::Error, format!("recv: {e}"));
            req.sess.close(StreamClose::VclFailure);
            req.to_synth(503, "Directive failure")
        }
    })
}

/// Derives the fingerprint through the directive hash phase.
fn run_hash(env: &ReqEnv, req: &mut Req) -> Result<crate::core::objstore::Digest, CitrineError> {
    let now = std::time::SystemTime::now();
    // The method is not part of the fingerprint: HEAD shares GET's objects
    // and PURGE must address the same digest it evicts.
    let mut accum = HashAccum::new();
    let action = {
        let mut ctx = vcl::VclCtx::new(VclMethod::Hash, now)
            .with_vsl(&mut req.vsl)
            .with_req(&mut req.http)
            .with_hash(&mut accum);
        vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Hash)
    };
    match action {
        Ok(VclAction::Lookup) => {}
        Ok(_) | Err(_) => return Err(CitrineError::VclFailure("vcl_hash")),
    }
    let digest = accum.finalize();
    req.vsl.logf(VslTag::Hash, hex::encode(&digest[..8]));
    Ok(digest)
}

async fn step_lookup(env: &ReqEnv, req: &mut Req) -> Result<ReqStep, CitrineError> {
    let digest = match run_hash(env, req) {
        Ok(d) => d,
        Err(_) => {
            req.sess.close(StreamClose::VclFailure);
            return Ok(req.to_synth(503, "Directive failure"));
        }
    };

    loop {
        let lookup = env.fetch.store.lookup(LookupParams {
            digest,
            req: &req.http,
            xid: req.vxid,
            grace_limit: req.switches.grace_limit,
            hash_ignore_busy: req.switches.hash_ignore_busy,
        });
        return Ok(match lookup {
            Lookup::Hit {
                oc,
                graced,
                bgfetch,
            } => {
                metrics::CACHE_HITS_TOTAL.inc();
                req.vsl.logf(VslTag::Hit, format!("{}", oc.id));
                if let Some(handle) = bgfetch {
                    start_fetch_task(env, req, handle, true);
                }
                req.objcore = Some(oc.clone());
                req.boc = oc.boc();
                req.graced = graced;
                let obj_status = oc
                    .obj()
                    .map(|o| o.attrs().status)
                    .unwrap_or(0);
                let now = std::time::SystemTime::now();
                let action = {
                    let mut ctx = vcl::VclCtx::new(VclMethod::Hit, now)
                        .with_vsl(&mut req.vsl)
                        .with_req(&mut req.http)
                        .with_obj_status(obj_status)
                        .with_synth(&mut req.synth)
                        .with_privs(&mut req.privs);
                    vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Hit)
                };
                match action {
                    Ok(VclAction::Deliver) => ReqStep::Deliver,
                    Ok(VclAction::Miss) => {
                        // Fetch anyway, bypassing this object.
                        req.drop_obj(env);
                        let handle = {
                            let mut p = env.fetch.store.private_miss(req.vxid);
                            p.uncacheable = false;
                            p
                        };
                        start_fetch_task(env, req, handle, false);
                        ReqStep::Fetch
                    }
                    Ok(VclAction::Pass) => {
                        req.drop_obj(env);
                        ReqStep::Pass
                    }
                    Ok(VclAction::Synth) => {
                        req.drop_obj(env);
                        if req.synth.status == 0 {
                            req.synth.status = 503;
                            req.synth.reason = "Service Unavailable".into();
                        }
                        ReqStep::Synth
                    }
                    Ok(VclAction::Restart) => {
                        req.drop_obj(env);
                        ReqStep::Restart
                    }
                    Ok(_) | Err(_) => {
                        req.drop_obj(env);
                        req.sess.close(StreamClose::VclFailure);
                        req.to_synth(503, "Directive failure")
                    }
                }
            }
            Lookup::Pass { oc } => {
                metrics::CACHE_HITPASS_TOTAL.inc();
                req.vsl.logf(VslTag::HitPass, format!("{}", oc.id));
                env.fetch.store.deref_oc(&oc);
                ReqStep::Pass
            }
            Lookup::Miss(handle) => {
                if handle.uncacheable {
                    req.vsl.logf(VslTag::HitMiss, format!("{}", handle.oc.id));
                } else {
                    req.vsl.log(VslTag::Miss, Bytes::new());
                }
                // vcl_miss picks the disposition before the fetch starts.
                let now = std::time::SystemTime::now();
                let action = {
                    let mut ctx = vcl::VclCtx::new(VclMethod::Miss, now)
                        .with_vsl(&mut req.vsl)
                        .with_req(&mut req.http)
                        .with_synth(&mut req.synth)
                        .with_privs(&mut req.privs);
                    vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Miss)
                };
                match action {
                    Ok(VclAction::Fetch) => {
                        start_fetch_task(env, req, handle, false);
                        ReqStep::Fetch
                    }
                    Ok(VclAction::Pass) => {
                        abandon_miss(env, handle);
                        ReqStep::Pass
                    }
                    Ok(VclAction::Synth) => {
                        abandon_miss(env, handle);
                        if req.synth.status == 0 {
                            req.synth.status = 503;
                            req.synth.reason = "Service Unavailable".into();
                        }
                        ReqStep::Synth
                    }
                    Ok(VclAction::Restart) => {
                        abandon_miss(env, handle);
                        ReqStep::Restart
                    }
                    Ok(_) | Err(_) => {
                        abandon_miss(env, handle);
                        req.sess.close(StreamClose::VclFailure);
                        req.to_synth(503, "Directive failure")
                    }
                }
            }
            Lookup::Wait { rx } => {
                // Parked: no worker is held while the fetcher works. The
                // wakeup re-enters lookup exactly once per signal.
                req.vsl.log(VslTag::Debug, &b"parked on busy object"[..]);
                match tokio::time::timeout(env.timeout_req, rx).await {
                    Ok(_) => continue,
                    Err(_) => {
                        req.sess.close(StreamClose::RxTimeout);
                        req.to_synth(503, "waiting list timeout")
                    }
                }
            }
        });
    }
}

fn step_pass(env: &ReqEnv, req: &mut Req) -> Result<ReqStep, CitrineError> {
    metrics::CACHE_MISSES_TOTAL.inc();
    req.vsl.log(VslTag::Pass, Bytes::new());
    let now = std::time::SystemTime::now();
    let action = {
        let mut ctx = vcl::VclCtx::new(VclMethod::Pass, now)
            .with_vsl(&mut req.vsl)
            .with_req(&mut req.http)
            .with_synth(&mut req.synth)
            .with_privs(&mut req.privs);
        vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Pass)
    };
    Ok(match action {
        Ok(VclAction::Fetch) => {
            let handle = env.fetch.store.private_miss(req.vxid);
            start_fetch_task(env, req, handle, false);
            ReqStep::Fetch
        }
        Ok(VclAction::Synth) => {
            if req.synth.status == 0 {
                req.synth.status = 503;
                req.synth.reason = "Service Unavailable".into();
            }
            ReqStep::Synth
        }
        Ok(VclAction::Restart) => ReqStep::Restart,
        Ok(_) | Err(_) => {
            req.sess.close(StreamClose::VclFailure);
            req.to_synth(503, "Directive failure")
        }
    })
}

fn step_purge(env: &ReqEnv, req: &mut Req) -> Result<ReqStep, CitrineError> {
    let digest = match run_hash(env, req) {
        Ok(d) => d,
        Err(_) => {
            req.sess.close(StreamClose::VclFailure);
            return Ok(req.to_synth(503, "Directive failure"));
        }
    };
    let n = env.fetch.store.purge_digest(&digest);
    req.vsl.logf(VslTag::ExpKill, format!("purged {n} objects"));

    let now = std::time::SystemTime::now();
    let action = {
        let mut ctx = vcl::VclCtx::new(VclMethod::Purge, now)
            .with_vsl(&mut req.vsl)
            .with_req(&mut req.http)
            .with_synth(&mut req.synth)
            .with_privs(&mut req.privs);
        vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Purge)
    };
    Ok(match action {
        Ok(VclAction::Synth) => {
            if req.synth.status == 0 {
                req.synth.status = 200;
                req.synth.reason = "Purged".into();
            }
            ReqStep::Synth
        }
        Ok(VclAction::Restart) => ReqStep::Restart,
        Ok(_) | Err(_) => {
            req.sess.close(StreamClose::VclFailure);
            req.to_synth(503, "Directive failure")
        }
    })
}

/// Waits for the spawned fetch to publish headers, then delivers.
async fn step_fetch(env: &ReqEnv, req: &mut Req) -> Result<ReqStep, CitrineError> {
    let Some(boc) = req.boc.clone() else {
        return Ok(req.to_synth(503, "no fetch in flight"));
    };
    let mut wait = boc.wait_state(BocState::ReqDone, env.timeout_req).await;
    // Non-streamable fetches (ESI parse pending, do_stream off) deliver only
    // once the object is complete.
    if matches!(&wait, Ok(snap) if !snap.state.is_terminal()) && !boc.streamable() {
        wait = boc.wait_state(BocState::Finished, env.timeout_req).await;
    }
    match wait {
        Ok(snap) if snap.state == BocState::Failed => {
            req.drop_obj(env);
            Ok(req.to_synth(503, "backend fetch failed"))
        }
        Ok(_) => Ok(ReqStep::Deliver),
        Err(CitrineError::Timeout) => {
            req.drop_obj(env);
            req.sess.close(StreamClose::RxTimeout);
            Ok(req.to_synth(503, "backend fetch timeout"))
        }
        Err(_) => {
            req.drop_obj(env);
            Ok(req.to_synth(503, "backend fetch failed"))
        }
    }
}
