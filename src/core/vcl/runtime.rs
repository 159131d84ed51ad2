// src/core/vcl/runtime.rs

//! Dispatch and the typed capability context handed to directive subs.
//!
//! Every accessor checks its legality against the current method before
//! touching the attribute, mirroring the per-attribute read/write method
//! masks of the directive language. Dispatch is two-step check-then-call
//! with a task-scoped recursion bitmap.

use crate::core::CitrineError;
use crate::core::http::HttpMsg;
use crate::core::objstore::HashAccum;
use crate::core::objstore::objcore::OcTtl;
use crate::core::vcl::privs::TaskPrivs;
use crate::core::vcl::{MethodMask, VclAction, VclMethod, VclProgram};
use crate::core::vsl::{Vsl, VslTag};
use bytes::Bytes;
use std::time::{Duration, SystemTime};

// Per-attribute access masks.
const REQ_R: MethodMask = MethodMask::CLIENT;
const REQ_W: MethodMask = MethodMask::CLIENT;
const BEREQ_RW: MethodMask = MethodMask::BACKEND.union(MethodMask::PIPE);
const BERESP_RW: MethodMask =
    MethodMask::BACKEND_RESPONSE.union(MethodMask::BACKEND_ERROR);
const RESP_RW: MethodMask = MethodMask::DELIVER.union(MethodMask::SYNTH);
const TTL_W: MethodMask = MethodMask::BACKEND_RESPONSE.union(MethodMask::BACKEND_ERROR);
const OBJ_R: MethodMask = MethodMask::HIT.union(MethodMask::DELIVER);
const HASH_ONLY: MethodMask = MethodMask::HASH;

/// Fetch-side switches a backend_response sub may flip.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchSwitches {
    pub do_esi: bool,
    pub do_gzip: bool,
    pub do_gunzip: bool,
    pub do_stream: bool,
    pub uncacheable: bool,
}

/// Request-side switches a recv sub may flip.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqSwitches {
    pub hash_ignore_busy: bool,
    /// The request's own bound on acceptable staleness.
    pub grace_limit: Option<Duration>,
}

/// The synthetic response under construction in vcl_synth.
#[derive(Debug, Clone, Default)]
pub struct SynthSpec {
    pub status: u16,
    pub reason: String,
    pub body: Vec<u8>,
}

/// The capability context handed to every sub.
pub struct VclCtx<'a> {
    pub method: VclMethod,
    pub now: SystemTime,
    pub(crate) called: u64,
    failed: bool,
    vsl: Option<&'a mut Vsl>,
    req: Option<&'a mut HttpMsg>,
    resp: Option<&'a mut HttpMsg>,
    bereq: Option<&'a mut HttpMsg>,
    beresp: Option<&'a mut HttpMsg>,
    obj_status: Option<u16>,
    ttl: Option<&'a mut OcTtl>,
    fetch_switches: Option<&'a mut FetchSwitches>,
    req_switches: Option<&'a mut ReqSwitches>,
    hash: Option<&'a mut HashAccum>,
    synth: Option<&'a mut SynthSpec>,
    privs: Option<&'a mut TaskPrivs>,
}

impl<'a> VclCtx<'a> {
    pub fn new(method: VclMethod, now: SystemTime) -> Self {
        Self {
            method,
            now,
            called: 0,
            failed: false,
            vsl: None,
            req: None,
            resp: None,
            bereq: None,
            beresp: None,
            obj_status: None,
            ttl: None,
            fetch_switches: None,
            req_switches: None,
            hash: None,
            synth: None,
            privs: None,
        }
    }

    pub fn with_vsl(mut self, vsl: &'a mut Vsl) -> Self {
        self.vsl = Some(vsl);
        self
    }

    pub fn with_req(mut self, req: &'a mut HttpMsg) -> Self {
        self.req = Some(req);
        self
    }

    pub fn with_resp(mut self, resp: &'a mut HttpMsg) -> Self {
        self.resp = Some(resp);
        self
    }

    pub fn with_bereq(mut self, bereq: &'a mut HttpMsg) -> Self {
        self.bereq = Some(bereq);
        self
    }

    pub fn with_beresp(mut self, beresp: &'a mut HttpMsg) -> Self {
        self.beresp = Some(beresp);
        self
    }

    pub fn with_obj_status(mut self, status: u16) -> Self {
        self.obj_status = Some(status);
        self
    }

    pub fn with_ttl(mut self, ttl: &'a mut OcTtl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_fetch_switches(mut self, s: &'a mut FetchSwitches) -> Self {
        self.fetch_switches = Some(s);
        self
    }

    pub fn with_req_switches(mut self, s: &'a mut ReqSwitches) -> Self {
        self.req_switches = Some(s);
        self
    }

    pub fn with_hash(mut self, hash: &'a mut HashAccum) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_synth(mut self, synth: &'a mut SynthSpec) -> Self {
        self.synth = Some(synth);
        self
    }

    pub fn with_privs(mut self, privs: &'a mut TaskPrivs) -> Self {
        self.privs = Some(privs);
        self
    }

    // --- Control ---

    /// Marks the task failed; observed by the dispatcher after the sub
    /// returns, cannot be caught.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Logs through the task's transaction log.
    pub fn log(&mut self, msg: &str) {
        if let Some(vsl) = self.vsl.as_deref_mut() {
            vsl.logf(VslTag::Debug, msg.to_string());
        }
    }

    fn allow(&self, what: &'static str, mask: MethodMask) -> Result<(), CitrineError> {
        if mask.contains(self.method.mask()) {
            Ok(())
        } else {
            Err(CitrineError::Internal(format!(
                "{} not accessible from {}",
                what, self.method
            )))
        }
    }

    fn missing(what: &'static str) -> CitrineError {
        CitrineError::Internal(format!("{what} not attached to this task"))
    }

    // --- req.* ---

    pub fn req_method(&self) -> Result<Bytes, CitrineError> {
        self.allow("req.method", REQ_R)?;
        Ok(self
            .req
            .as_deref()
            .ok_or_else(|| Self::missing("req"))?
            .method
            .clone())
    }

    pub fn req_url(&self) -> Result<Bytes, CitrineError> {
        self.allow("req.url", REQ_R)?;
        Ok(self
            .req
            .as_deref()
            .ok_or_else(|| Self::missing("req"))?
            .url
            .clone())
    }

    pub fn set_req_url(&mut self, url: &[u8]) -> Result<(), CitrineError> {
        self.allow("req.url", REQ_W)?;
        self.req
            .as_deref_mut()
            .ok_or_else(|| Self::missing("req"))?
            .url = Bytes::copy_from_slice(url);
        Ok(())
    }

    pub fn req_header(&self, name: &str) -> Result<Option<Bytes>, CitrineError> {
        self.allow("req.http", REQ_R)?;
        Ok(self
            .req
            .as_deref()
            .ok_or_else(|| Self::missing("req"))?
            .get(name)
            .cloned())
    }

    pub fn set_req_header(&mut self, name: &str, value: &str) -> Result<(), CitrineError> {
        self.allow("req.http", REQ_W)?;
        self.req
            .as_deref_mut()
            .ok_or_else(|| Self::missing("req"))?
            .replace(name, Bytes::copy_from_slice(value.as_bytes()));
        Ok(())
    }

    pub fn unset_req_header(&mut self, name: &str) -> Result<(), CitrineError> {
        self.allow("req.http", REQ_W)?;
        self.req
            .as_deref_mut()
            .ok_or_else(|| Self::missing("req"))?
            .unset(name);
        Ok(())
    }

    // --- bereq.* ---

    pub fn bereq_url(&self) -> Result<Bytes, CitrineError> {
        self.allow("bereq.url", BEREQ_RW)?;
        Ok(self
            .bereq
            .as_deref()
            .ok_or_else(|| Self::missing("bereq"))?
            .url
            .clone())
    }

    pub fn bereq_header(&self, name: &str) -> Result<Option<Bytes>, CitrineError> {
        self.allow("bereq.http", BEREQ_RW)?;
        Ok(self
            .bereq
            .as_deref()
            .ok_or_else(|| Self::missing("bereq"))?
            .get(name)
            .cloned())
    }

    pub fn set_bereq_header(&mut self, name: &str, value: &str) -> Result<(), CitrineError> {
        self.allow("bereq.http", BEREQ_RW)?;
        self.bereq
            .as_deref_mut()
            .ok_or_else(|| Self::missing("bereq"))?
            .replace(name, Bytes::copy_from_slice(value.as_bytes()));
        Ok(())
    }

    pub fn unset_bereq_header(&mut self, name: &str) -> Result<(), CitrineError> {
        self.allow("bereq.http", BEREQ_RW)?;
        self.bereq
            .as_deref_mut()
            .ok_or_else(|| Self::missing("bereq"))?
            .unset(name);
        Ok(())
    }

    // --- beresp.* ---

    pub fn beresp_status(&self) -> Result<u16, CitrineError> {
        self.allow("beresp.status", BERESP_RW)?;
        Ok(self
            .beresp
            .as_deref()
            .ok_or_else(|| Self::missing("beresp"))?
            .status)
    }

    pub fn set_beresp_status(&mut self, status: u16) -> Result<(), CitrineError> {
        self.allow("beresp.status", BERESP_RW)?;
        self.beresp
            .as_deref_mut()
            .ok_or_else(|| Self::missing("beresp"))?
            .status = status;
        Ok(())
    }

    pub fn beresp_header(&self, name: &str) -> Result<Option<Bytes>, CitrineError> {
        self.allow("beresp.http", BERESP_RW)?;
        Ok(self
            .beresp
            .as_deref()
            .ok_or_else(|| Self::missing("beresp"))?
            .get(name)
            .cloned())
    }

    pub fn set_beresp_header(&mut self, name: &str, value: &str) -> Result<(), CitrineError> {
        self.allow("beresp.http", BERESP_RW)?;
        self.beresp
            .as_deref_mut()
            .ok_or_else(|| Self::missing("beresp"))?
            .replace(name, Bytes::copy_from_slice(value.as_bytes()));
        Ok(())
    }

    pub fn unset_beresp_header(&mut self, name: &str) -> Result<(), CitrineError> {
        self.allow("beresp.http", BERESP_RW)?;
        self.beresp
            .as_deref_mut()
            .ok_or_else(|| Self::missing("beresp"))?
            .unset(name);
        Ok(())
    }

    // --- resp.* ---

    pub fn resp_status(&self) -> Result<u16, CitrineError> {
        self.allow("resp.status", RESP_RW)?;
        Ok(self
            .resp
            .as_deref()
            .ok_or_else(|| Self::missing("resp"))?
            .status)
    }

    pub fn set_resp_status(&mut self, status: u16, reason: &str) -> Result<(), CitrineError> {
        self.allow("resp.status", RESP_RW)?;
        let resp = self
            .resp
            .as_deref_mut()
            .ok_or_else(|| Self::missing("resp"))?;
        resp.status = status;
        resp.reason = Bytes::copy_from_slice(reason.as_bytes());
        Ok(())
    }

    pub fn resp_header(&self, name: &str) -> Result<Option<Bytes>, CitrineError> {
        self.allow("resp.http", RESP_RW)?;
        Ok(self
            .resp
            .as_deref()
            .ok_or_else(|| Self::missing("resp"))?
            .get(name)
            .cloned())
    }

    pub fn set_resp_header(&mut self, name: &str, value: &str) -> Result<(), CitrineError> {
        self.allow("resp.http", RESP_RW)?;
        self.resp
            .as_deref_mut()
            .ok_or_else(|| Self::missing("resp"))?
            .replace(name, Bytes::copy_from_slice(value.as_bytes()));
        Ok(())
    }

    pub fn unset_resp_header(&mut self, name: &str) -> Result<(), CitrineError> {
        self.allow("resp.http", RESP_RW)?;
        self.resp
            .as_deref_mut()
            .ok_or_else(|| Self::missing("resp"))?
            .unset(name);
        Ok(())
    }

    // --- obj.* ---

    pub fn obj_status(&self) -> Result<u16, CitrineError> {
        self.allow("obj.status", OBJ_R)?;
        self.obj_status.ok_or_else(|| Self::missing("obj"))
    }

    // --- Freshness ---

    pub fn ttl(&self) -> Result<Duration, CitrineError> {
        self.allow("beresp.ttl", BERESP_RW)?;
        Ok(self.ttl.as_deref().ok_or_else(|| Self::missing("ttl"))?.ttl)
    }

    pub fn set_ttl(&mut self, ttl: Duration) -> Result<(), CitrineError> {
        self.allow("beresp.ttl", TTL_W)?;
        self.ttl
            .as_deref_mut()
            .ok_or_else(|| Self::missing("ttl"))?
            .ttl = ttl;
        Ok(())
    }

    pub fn set_grace(&mut self, grace: Duration) -> Result<(), CitrineError> {
        self.allow("beresp.grace", TTL_W)?;
        self.ttl
            .as_deref_mut()
            .ok_or_else(|| Self::missing("ttl"))?
            .grace = grace;
        Ok(())
    }

    pub fn set_keep(&mut self, keep: Duration) -> Result<(), CitrineError> {
        self.allow("beresp.keep", TTL_W)?;
        self.ttl
            .as_deref_mut()
            .ok_or_else(|| Self::missing("ttl"))?
            .keep = keep;
        Ok(())
    }

    // --- Switches ---

    pub fn set_uncacheable(&mut self) -> Result<(), CitrineError> {
        self.allow("beresp.uncacheable", MethodMask::BACKEND_RESPONSE)?;
        self.fetch_switches
            .as_deref_mut()
            .ok_or_else(|| Self::missing("fetch switches"))?
            .uncacheable = true;
        Ok(())
    }

    pub fn set_do_stream(&mut self, v: bool) -> Result<(), CitrineError> {
        self.allow("beresp.do_stream", MethodMask::BACKEND_RESPONSE)?;
        self.fetch_switches
            .as_deref_mut()
            .ok_or_else(|| Self::missing("fetch switches"))?
            .do_stream = v;
        Ok(())
    }

    pub fn set_do_esi(&mut self, v: bool) -> Result<(), CitrineError> {
        self.allow("beresp.do_esi", MethodMask::BACKEND_RESPONSE)?;
        self.fetch_switches
            .as_deref_mut()
            .ok_or_else(|| Self::missing("fetch switches"))?
            .do_esi = v;
        Ok(())
    }

    pub fn set_do_gzip(&mut self, v: bool) -> Result<(), CitrineError> {
        self.allow("beresp.do_gzip", MethodMask::BACKEND_RESPONSE)?;
        self.fetch_switches
            .as_deref_mut()
            .ok_or_else(|| Self::missing("fetch switches"))?
            .do_gzip = v;
        Ok(())
    }

    pub fn set_do_gunzip(&mut self, v: bool) -> Result<(), CitrineError> {
        self.allow("beresp.do_gunzip", MethodMask::BACKEND_RESPONSE)?;
        self.fetch_switches
            .as_deref_mut()
            .ok_or_else(|| Self::missing("fetch switches"))?
            .do_gunzip = v;
        Ok(())
    }

    pub fn set_hash_ignore_busy(&mut self, v: bool) -> Result<(), CitrineError> {
        self.allow("req.hash_ignore_busy", MethodMask::RECV)?;
        self.req_switches
            .as_deref_mut()
            .ok_or_else(|| Self::missing("req switches"))?
            .hash_ignore_busy = v;
        Ok(())
    }

    pub fn set_req_grace(&mut self, grace: Duration) -> Result<(), CitrineError> {
        self.allow("req.grace", MethodMask::RECV)?;
        self.req_switches
            .as_deref_mut()
            .ok_or_else(|| Self::missing("req switches"))?
            .grace_limit = Some(grace);
        Ok(())
    }

    // --- Hash ---

    /// Feeds one canonical byte string into the request fingerprint.
    pub fn hash_data(&mut self, data: &[u8]) -> Result<(), CitrineError> {
        self.allow("hash_data", HASH_ONLY)?;
        self.hash
            .as_deref_mut()
            .ok_or_else(|| Self::missing("hash"))?
            .update(data);
        Ok(())
    }

    // --- Synth ---

    pub fn set_synth_status(&mut self, status: u16, reason: &str) -> Result<(), CitrineError> {
        // Any phase that can return synth may pick the status first.
        self.allow(
            "synth.status",
            MethodMask::CLIENT.union(MethodMask::BACKEND_ERROR),
        )?;
        let synth = self
            .synth
            .as_deref_mut()
            .ok_or_else(|| Self::missing("synth"))?;
        synth.status = status;
        synth.reason = reason.to_string();
        Ok(())
    }

    pub fn synth_body(&mut self, body: &[u8]) -> Result<(), CitrineError> {
        self.allow(
            "synth.body",
            MethodMask::SYNTH.union(MethodMask::BACKEND_ERROR),
        )?;
        self.synth
            .as_deref_mut()
            .ok_or_else(|| Self::missing("synth"))?
            .body
            .extend_from_slice(body);
        Ok(())
    }

    // --- Private storage ---

    pub fn privs(&mut self) -> Result<&mut TaskPrivs, CitrineError> {
        self.privs
            .as_deref_mut()
            .ok_or_else(|| Self::missing("privs"))
    }
}

/// Invokes a sub by index: check-then-call with recursion detection.
pub fn call_sub(
    prog: &VclProgram,
    ctx: &mut VclCtx<'_>,
    idx: usize,
) -> Result<VclAction, CitrineError> {
    let sub = prog
        .sub(idx)
        .ok_or_else(|| CitrineError::Internal(format!("no sub #{idx}")))?;
    if !sub.methods.contains(ctx.method.mask()) {
        return Err(CitrineError::Internal(format!(
            "sub '{}' not callable from {}",
            sub.name, ctx.method
        )));
    }
    let bit = 1u64 << (idx as u32);
    if ctx.called & bit != 0 {
        return Err(CitrineError::VclRecursion(sub.name.clone()));
    }
    ctx.called |= bit;
    let body = sub.body.clone();
    let action = body(ctx, prog)?;
    ctx.called &= !bit;
    if ctx.failed {
        return Err(CitrineError::VclFailure(ctx.method.entry_name()));
    }
    Ok(action)
}

/// Dispatches the entry sub for a phase and validates the disposition
/// against both the method's and the sub's legal return sets.
pub fn dispatch(
    prog: &VclProgram,
    ctx: &mut VclCtx<'_>,
    method: VclMethod,
) -> Result<VclAction, CitrineError> {
    ctx.method = method;
    ctx.called = 0;
    let idx = prog.entry(method).ok_or_else(|| {
        CitrineError::Internal(format!(
            "program '{}' has no {} sub",
            prog.name,
            method.entry_name()
        ))
    })?;
    if let Some(vsl) = ctx.vsl.as_deref_mut() {
        vsl.logf(VslTag::VclCall, method.entry_name().to_string());
    }
    let action = call_sub(prog, ctx, idx)?;
    let sub = prog.sub(idx).unwrap();
    if !method.legal_actions().contains(action.mask()) || !sub.returns.contains(action.mask()) {
        return Err(CitrineError::IllegalReturn {
            sub: sub.name.clone(),
            action: action.as_static(),
        });
    }
    if let Some(vsl) = ctx.vsl.as_deref_mut() {
        vsl.logf(VslTag::VclReturn, action.as_static().to_string());
    }
    Ok(action)
}
