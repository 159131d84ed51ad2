// src/core/req/deliver.rs

//! The delivery pipeline: turns a picked object into response events.
//!
//! Handles conditional downgrades to 304, range subsetting, delivery-time
//! gunzip, ESI expansion with bounded recursion, and streaming from an
//! object still being fetched by following its BOC.

use crate::connection::session::StreamClose;
use crate::core::CitrineError;
use crate::core::fetch::esi::{self, EsiSeg};
use crate::core::fetch::freshness;
use crate::core::http::HttpMsg;
use crate::core::objstore::boc::{Boc, BocState};
use crate::core::proto::http1::WireFraming;
use crate::core::req::{Req, ReqEnv, ReqStep, run_req};
use crate::core::storage::object::StoredObject;
use crate::core::vcl::{self, VclAction, VclMethod};
use crate::core::vsl::VslTag;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzDecoder;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Where response events go. The protocol layer implements this over the
/// client connection; ESI children and tests implement it differently.
#[async_trait]
pub trait DeliverySink: Send {
    async fn send_head(&mut self, resp: &HttpMsg, framing: WireFraming)
    -> Result<(), CitrineError>;

    async fn send_body(&mut self, flush: bool, data: Bytes) -> Result<(), CitrineError>;

    async fn finish(&mut self) -> Result<(), CitrineError>;
}

/// Streams object body bytes, following the BOC while a fetch is in flight.
pub struct ObjIter {
    obj: Arc<StoredObject>,
    boc: Option<Arc<Boc>>,
    wait: Duration,
    cursor: u64,
    /// Exclusive upper bound, for range delivery.
    end: Option<u64>,
}

impl ObjIter {
    pub fn new(
        obj: Arc<StoredObject>,
        boc: Option<Arc<Boc>>,
        wait: Duration,
        start: u64,
        end: Option<u64>,
    ) -> Self {
        Self {
            obj,
            boc,
            wait,
            cursor: start,
            end,
        }
    }

    /// The next run of bytes, or `None` at end of body.
    pub async fn next(&mut self) -> Result<Option<Bytes>, CitrineError> {
        loop {
            if let Some(end) = self.end
                && self.cursor >= end
            {
                return Ok(None);
            }
            // Committed length: BOC while in flight, storage afterwards.
            let avail = match &self.boc {
                Some(boc) => {
                    let snap = boc.snapshot();
                    if snap.state == BocState::Failed {
                        return Err(CitrineError::FetchFailed("fetch failed mid-stream".into()));
                    }
                    if snap.state == BocState::Finished {
                        self.boc = None;
                        self.obj.get_len()
                    } else {
                        snap.len
                    }
                }
                None => self.obj.get_len(),
            };
            let mut limit = avail;
            if let Some(end) = self.end {
                limit = limit.min(end);
            }
            if self.cursor < limit {
                let data = self.slice_at(self.cursor, limit);
                if !data.is_empty() {
                    self.cursor += data.len() as u64;
                    return Ok(Some(data));
                }
            }
            let Some(boc) = self.boc.clone() else {
                return Ok(None);
            };
            let snap = boc.wait_progress(self.cursor, self.wait).await?;
            if snap.state == BocState::Failed {
                return Err(CitrineError::FetchFailed("fetch failed mid-stream".into()));
            }
            if snap.state == BocState::Finished && snap.len <= self.cursor {
                return Ok(None);
            }
        }
    }

    /// One contiguous slice starting at `at`, bounded by `limit`.
    fn slice_at(&self, at: u64, limit: u64) -> Bytes {
        let mut off = 0u64;
        for seg in self.obj.segments() {
            let seg_len = seg.len() as u64;
            if at < off + seg_len {
                let start = (at - off) as usize;
                let end = seg_len.min(limit - off) as usize;
                if start >= end {
                    return Bytes::new();
                }
                return seg.slice(start..end);
            }
            off += seg_len;
        }
        Bytes::new()
    }
}

/// A parsed, satisfiable byte range: `[start, end]` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// Not a range we handle; serve the full body.
    Ignore,
    /// Serve the subrange.
    Partial { start: u64, end: u64 },
    /// 416 with `Content-Range: bytes */len`.
    Unsatisfiable,
}

/// Interprets a `Range` header against a known body length. Only single
/// byte ranges are subsetted; anything else is served whole.
pub fn parse_range(value: &str, len: u64) -> RangeOutcome {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Ignore;
    };
    if spec.contains(',') {
        // Multipart ranges are not supported; serve the whole object.
        return RangeOutcome::Ignore;
    }
    let Some((lo, hi)) = spec.split_once('-') else {
        return RangeOutcome::Ignore;
    };
    let (lo, hi) = (lo.trim(), hi.trim());
    if lo.is_empty() {
        // Suffix form: last N bytes.
        let Ok(n) = hi.parse::<u64>() else {
            return RangeOutcome::Ignore;
        };
        if n == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let start = len.saturating_sub(n);
        if len == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        return RangeOutcome::Partial {
            start,
            end: len - 1,
        };
    }
    let Ok(start) = lo.parse::<u64>() else {
        return RangeOutcome::Ignore;
    };
    if start >= len {
        return RangeOutcome::Unsatisfiable;
    }
    let end = if hi.is_empty() {
        len - 1
    } else {
        match hi.parse::<u64>() {
            // Ends past the object clamp to the last byte.
            Ok(e) => e.min(len - 1),
            Err(_) => return RangeOutcome::Ignore,
        }
    };
    if end < start {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial { start, end }
}

/// Whether the stored validators satisfy the request's conditional headers.
fn not_modified(req: &HttpMsg, etag: Option<&[u8]>, last_modified: Option<&[u8]>) -> bool {
    if let Some(inm) = req.get("if-none-match") {
        if let Some(etag) = etag {
            let strip = |t: &[u8]| t.strip_prefix(b"W/").unwrap_or(t).to_vec();
            if inm.as_ref() == b"*" || strip(inm.as_ref()) == strip(etag) {
                return true;
            }
        }
        return false;
    }
    if let Some(ims) = req.get_str("if-modified-since")
        && let Some(lm) = last_modified
        && let Some(ims_t) = freshness::parse_http_date(ims)
        && let Some(lm_t) =
            std::str::from_utf8(lm).ok().and_then(freshness::parse_http_date)
    {
        return lm_t <= ims_t;
    }
    false
}

/// The DELIVER step.
pub async fn step_deliver(
    env: &ReqEnv,
    req: &mut Req,
    sink: &mut dyn DeliverySink,
) -> Result<ReqStep, CitrineError> {
    let Some(oc) = req.objcore.clone() else {
        return Ok(req.to_synth(503, "no object to deliver"));
    };
    let Some(obj) = oc.obj() else {
        return Ok(req.to_synth(503, "object has no body"));
    };
    let attrs = obj.attrs();

    // Build the response from the stored attributes.
    let mut resp = HttpMsg::new_response(&attrs.proto, attrs.status, &attrs.reason);
    resp.headers = crate::core::http::decode_headers(&attrs.headers)?;
    let age = std::time::SystemTime::now()
        .duration_since(oc.ttl_state().t_origin)
        .unwrap_or(Duration::ZERO);
    resp.replace("age", age.as_secs().to_string().into_bytes());
    resp.set("via", &b"1.1 citrine"[..]);
    resp.replace(
        "x-citrine",
        format!("{} {}", req.vxid, attrs.xid).into_bytes(),
    );
    if req.graced {
        req.vsl.log(VslTag::Debug, &b"grace hit"[..]);
    }

    // vcl_deliver may rewrite the response or bail out.
    let now = std::time::SystemTime::now();
    let action = {
        let mut ctx = vcl::VclCtx::new(VclMethod::Deliver, now)
            .with_vsl(&mut req.vsl)
            .with_req(&mut req.http)
            .with_resp(&mut resp)
            .with_obj_status(attrs.status)
            .with_synth(&mut req.synth)
            .with_privs(&mut req.privs);
        vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Deliver)
    };
    match action {
        Ok(VclAction::Deliver) => {}
        Ok(VclAction::Restart) => return Ok(ReqStep::Restart),
        Ok(VclAction::Synth) => {
            if req.synth.status == 0 {
                req.synth.status = 503;
                req.synth.reason = "Service Unavailable".into();
            }
            return Ok(ReqStep::Synth);
        }
        Ok(_) | Err(_) => {
            req.sess.close(StreamClose::VclFailure);
            return Ok(req.to_synth(503, "Directive failure"));
        }
    }

    let is_head = req.http.method.as_ref() == b"HEAD";
    let boc = req.boc.clone().filter(|b| !b.state().is_terminal());
    let complete_len = if boc.is_none() { Some(obj.get_len()) } else { None };

    // ESI expansion takes over delivery wholesale.
    if let Some(esi_blob) = &attrs.esi
        && req.esi_level < env.max_esi_depth
    {
        let segs = esi::decode_segments(esi_blob)?;
        return esi_deliver(env, req, sink, &mut resp, obj.clone(), segs, is_head).await;
    }

    // Conditional downgrade: 200 becomes 304, body stripped, length unset.
    if attrs.status == 200
        && not_modified(
            &req.http,
            attrs.etag.as_deref(),
            attrs.last_modified.as_deref(),
        )
    {
        resp.status = 304;
        resp.reason = Bytes::from_static(b"Not Modified");
        resp.unset("content-length");
        resp.unset("content-encoding");
        sink.send_head(&resp, WireFraming::Len(0)).await?;
        sink.finish().await?;
        return Ok(ReqStep::Done);
    }

    // Delivery-time gunzip for clients that do not accept gzip.
    let client_gzip = req
        .http
        .get_str("accept-encoding")
        .is_some_and(|ae| ae.split(',').any(|t| t.trim().starts_with("gzip")));
    let gunzip_out = attrs.gzipped && !client_gzip;
    if gunzip_out {
        resp.unset("content-encoding");
        resp.unset("content-length");
    }

    // Range only applies to complete 200s of known length.
    let mut start = 0u64;
    let mut end: Option<u64> = None;
    if env.range_support
        && attrs.status == 200
        && !gunzip_out
        && let Some(len) = complete_len
        && let Some(range) = req.http.get_str("range")
    {
        match parse_range(range, len) {
            RangeOutcome::Ignore => {}
            RangeOutcome::Partial {
                start: s,
                end: e,
            } => {
                resp.status = 206;
                resp.reason = Bytes::from_static(b"Partial Content");
                resp.replace(
                    "content-range",
                    format!("bytes {s}-{e}/{len}").into_bytes(),
                );
                start = s;
                end = Some(e + 1);
            }
            RangeOutcome::Unsatisfiable => {
                req.drop_obj(env);
                req.synth = crate::core::vcl::runtime::SynthSpec {
                    status: 416,
                    reason: "Range Not Satisfiable".to_string(),
                    body: Vec::new(),
                };
                return Ok(ReqStep::Synth);
            }
        }
    }

    // Framing: explicit length when known, chunked otherwise.
    let framing = if resp.status == 204 || resp.status == 304 {
        resp.unset("content-length");
        WireFraming::Len(0)
    } else if let Some(e) = end {
        let n = e - start;
        resp.replace("content-length", n.to_string().into_bytes());
        WireFraming::Len(n)
    } else if gunzip_out {
        WireFraming::Chunked
    } else if let Some(cl) = resp.get_str("content-length").and_then(|v| v.parse::<u64>().ok())
    {
        WireFraming::Len(cl)
    } else if let Some(len) = complete_len {
        resp.replace("content-length", len.to_string().into_bytes());
        WireFraming::Len(len)
    } else {
        WireFraming::Chunked
    };

    sink.send_head(&resp, framing).await?;
    req.vsl.logf(VslTag::RespStatus, resp.status.to_string());

    if is_head || matches!(framing, WireFraming::Len(0)) {
        sink.finish().await?;
        return Ok(ReqStep::Done);
    }

    let mut iter = ObjIter::new(obj, boc, env.between_bytes, start, end);
    let mut gunzip = gunzip_out.then(|| GzDecoder::new(Vec::new()));
    loop {
        match iter.next().await {
            Ok(Some(data)) => {
                let out = match gunzip.as_mut() {
                    Some(dec) => {
                        dec.write_all(&data).map_err(|e| {
                            CitrineError::FilterError(format!("deliver gunzip: {e}"))
                        })?;
                        Bytes::from(std::mem::take(dec.get_mut()))
                    }
                    None => data,
                };
                if out.is_empty() {
                    continue;
                }
                req.acct_body_out += out.len() as u64;
                if let Err(e) = sink.send_body(true, out).await {
                    req.sess.close(StreamClose::TxError);
                    return Err(e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                // The object is unaffected; only this delivery dies.
                req.sess.close(StreamClose::TxError);
                return Err(e);
            }
        }
    }
    if let Some(dec) = gunzip.take() {
        let rest = dec
            .finish()
            .map_err(|e| CitrineError::FilterError(format!("deliver gunzip: {e}")))?;
        if !rest.is_empty() {
            req.acct_body_out += rest.len() as u64;
            sink.send_body(true, Bytes::from(rest)).await?;
        }
    }
    sink.finish().await?;
    Ok(ReqStep::Done)
}

/// A sink wrapper for ESI children: heads are dropped, bodies flow into the
/// parent response.
struct EsiChildSink<'a> {
    parent: &'a mut dyn DeliverySink,
}

#[async_trait]
impl DeliverySink for EsiChildSink<'_> {
    async fn send_head(
        &mut self,
        _resp: &HttpMsg,
        _framing: WireFraming,
    ) -> Result<(), CitrineError> {
        Ok(())
    }

    async fn send_body(&mut self, flush: bool, data: Bytes) -> Result<(), CitrineError> {
        self.parent.send_body(flush, data).await
    }

    async fn finish(&mut self) -> Result<(), CitrineError> {
        Ok(())
    }
}

/// Expands an ESI-parsed object: literals from storage, includes as child
/// requests with bounded recursion.
async fn esi_deliver(
    env: &ReqEnv,
    req: &mut Req,
    sink: &mut dyn DeliverySink,
    resp: &mut HttpMsg,
    obj: Arc<StoredObject>,
    segs: Vec<EsiSeg>,
    is_head: bool,
) -> Result<ReqStep, CitrineError> {
    // Expanded length is unknowable up front.
    resp.unset("content-length");
    sink.send_head(resp, WireFraming::Chunked).await?;
    if is_head {
        sink.finish().await?;
        return Ok(ReqStep::Done);
    }

    for seg in segs {
        match seg {
            EsiSeg::Literal { off, len } => {
                let mut iter =
                    ObjIter::new(obj.clone(), None, env.between_bytes, off, Some(off + len));
                while let Some(data) = iter.next().await? {
                    req.acct_body_out += data.len() as u64;
                    sink.send_body(false, data).await?;
                }
            }
            EsiSeg::Include { src } => {
                req.vsl.logf(VslTag::EsiIncl, src.clone());
                if req.esi_level + 1 >= env.max_esi_depth {
                    // Too deep: a diagnostic fragment inline, parent lives on.
                    let diag = format!("<!-- esi include {src}: depth limit exceeded -->");
                    sink.send_body(false, Bytes::from(diag)).await?;
                    continue;
                }
                let mut child_http = req.http0.clone();
                child_http.method = Bytes::from_static(b"GET");
                child_http.url = Bytes::copy_from_slice(src.as_bytes());
                child_http.unset("range");
                child_http.unset("if-none-match");
                child_http.unset("if-modified-since");
                let mut child = Req::new(req.sess.clone(), child_http, None, env);
                child.esi_level = req.esi_level + 1;
                let mut child_sink = EsiChildSink { parent: &mut *sink };
                let outcome =
                    Box::pin(run_req(env, &mut child, &mut child_sink)).await;
                req.acct_body_out += child.acct_body_out;
                if let Err(e) = outcome {
                    let diag = format!("<!-- esi include {src} failed: {e} -->");
                    sink.send_body(false, Bytes::from(diag)).await?;
                }
            }
        }
    }
    sink.finish().await?;
    Ok(ReqStep::Done)
}
