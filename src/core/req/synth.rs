// src/core/req/synth.rs

//! Synthetic responses: built in the request workspace, shaped by the
//! vcl_synth phase.

use crate::connection::session::StreamClose;
use crate::core::CitrineError;
use crate::core::http::HttpMsg;
use crate::core::metrics;
use crate::core::proto::http1::WireFraming;
use crate::core::req::deliver::DeliverySink;
use crate::core::req::{Req, ReqEnv, ReqStep};
use crate::core::fetch::freshness;
use crate::core::vcl::{self, VclAction, VclMethod};
use crate::core::vsl::{Vxid, VslTag};
use bytes::Bytes;

/// The default error page body.
pub fn default_error_body(status: u16, reason: &str, xid: Vxid) -> Vec<u8> {
    format!(
        "<!DOCTYPE html>\n<html>\n  <head>\n    <title>{status} {reason}</title>\n  </head>\n  <body>\n    <h1>Error {status} {reason}</h1>\n    <p>{reason}</p>\n    <h3>Guru Meditation:</h3>\n    <p>XID: {xid}</p>\n    <hr>\n    <p>Citrine cache server</p>\n  </body>\n</html>\n"
    )
    .into_bytes()
}

/// The SYNTH step: build and deliver a synthetic response.
pub async fn step_synth(
    env: &ReqEnv,
    req: &mut Req,
    sink: &mut dyn DeliverySink,
) -> Result<ReqStep, CitrineError> {
    metrics::SYNTH_RESPONSES_TOTAL.inc();
    if req.synth.status == 0 {
        req.synth.status = 503;
        req.synth.reason = "Service Unavailable".to_string();
    }

    let now = std::time::SystemTime::now();
    let mut resp = HttpMsg::new_response(
        b"HTTP/1.1",
        req.synth.status,
        req.synth.reason.as_bytes(),
    );
    resp.set("date", freshness::format_http_date(now).into_bytes());
    resp.set("server", &b"citrine"[..]);
    resp.set("content-type", &b"text/html; charset=utf-8"[..]);
    resp.replace("x-citrine", req.vxid.to_string().into_bytes());

    let action = {
        let mut synth = std::mem::take(&mut req.synth);
        let mut ctx = vcl::VclCtx::new(VclMethod::Synth, now)
            .with_vsl(&mut req.vsl)
            .with_req(&mut req.http)
            .with_resp(&mut resp)
            .with_synth(&mut synth)
            .with_privs(&mut req.privs);
        let action = vcl::dispatch(&env.fetch.program, &mut ctx, VclMethod::Synth);
        req.synth = synth;
        action
    };
    match action {
        Ok(VclAction::Deliver) => {}
        Ok(VclAction::Restart) => return Ok(ReqStep::Restart),
        Ok(_) | Err(_) => {
            // A failing synth cannot synth again; the transaction dies.
            req.sess.close(StreamClose::VclFailure);
            return Err(CitrineError::VclFailure("vcl_synth"));
        }
    }

    // vcl_synth may have overridden status or body.
    if req.synth.status != 0 {
        resp.status = req.synth.status;
        if !req.synth.reason.is_empty() {
            resp.reason = Bytes::from(req.synth.reason.clone().into_bytes());
        }
    }
    let body = if req.synth.body.is_empty() {
        default_error_body(
            resp.status,
            std::str::from_utf8(&resp.reason).unwrap_or("Error"),
            req.vxid,
        )
    } else {
        std::mem::take(&mut req.synth.body)
    };

    // Synthetic bodies are assembled in the request workspace.
    let body = match req.ws.copy(&body) {
        Ok(tok) => Bytes::copy_from_slice(req.ws.slice(&tok)),
        Err(_) => {
            // Workspace exhausted: fall back to the unbuffered body rather
            // than failing the error path itself.
            Bytes::from(body)
        }
    };

    let is_head = req.http.method.as_ref() == b"HEAD";
    resp.replace("content-length", body.len().to_string().into_bytes());
    req.vsl.logf(VslTag::RespStatus, resp.status.to_string());
    sink.send_head(&resp, WireFraming::Len(body.len() as u64))
        .await?;
    if !is_head && !body.is_empty() {
        req.acct_body_out += body.len() as u64;
        if let Err(e) = sink.send_body(true, body).await {
            req.sess.close(StreamClose::TxError);
            return Err(e);
        }
    }
    sink.finish().await?;
    Ok(ReqStep::Done)
}
