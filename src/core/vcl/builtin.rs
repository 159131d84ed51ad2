// src/core/vcl/builtin.rs

//! The builtin directive program: the default policy every loaded program
//! falls back to, expressed directly against the runtime API.

use crate::core::CitrineError;
use crate::core::vcl::{
    ActionMask, MethodMask, SubBody, VclAction, VclProgram,
};
use std::sync::Arc;

fn body(
    f: impl for<'a, 'b> Fn(
        &'a mut crate::core::vcl::VclCtx<'b>,
        &'a VclProgram,
    ) -> Result<VclAction, CitrineError>
    + Send
    + Sync
    + 'static,
) -> SubBody {
    Arc::new(f)
}

/// Builds the builtin program.
pub fn builtin_program() -> Arc<VclProgram> {
    VclProgram::builder("builtin")
        .define(
            "vcl_recv",
            MethodMask::RECV,
            ActionMask::LOOKUP | ActionMask::PASS | ActionMask::PIPE | ActionMask::PURGE,
            "builtin:vcl_recv",
            body(|ctx, _prog| {
                let method = ctx.req_method()?;
                if method.as_ref() == b"PURGE" {
                    return Ok(VclAction::Purge);
                }
                if !matches!(method.as_ref(), b"GET" | b"HEAD") {
                    // Only GET and HEAD results are worth caching.
                    return Ok(VclAction::Pass);
                }
                if ctx.req_header("authorization")?.is_some()
                    || ctx.req_header("cookie")?.is_some()
                {
                    return Ok(VclAction::Pass);
                }
                Ok(VclAction::Lookup)
            }),
        )
        .define(
            "vcl_pipe",
            MethodMask::PIPE,
            ActionMask::PIPE,
            "builtin:vcl_pipe",
            body(|_ctx, _prog| Ok(VclAction::Pipe)),
        )
        .define(
            "vcl_pass",
            MethodMask::PASS,
            ActionMask::FETCH,
            "builtin:vcl_pass",
            body(|_ctx, _prog| Ok(VclAction::Fetch)),
        )
        .define(
            "vcl_hash",
            MethodMask::HASH,
            ActionMask::LOOKUP,
            "builtin:vcl_hash",
            body(|ctx, _prog| {
                let url = ctx.req_url()?;
                ctx.hash_data(&url)?;
                if let Some(host) = ctx.req_header("host")? {
                    ctx.hash_data(&host)?;
                }
                Ok(VclAction::Lookup)
            }),
        )
        .define(
            "vcl_purge",
            MethodMask::PURGE,
            ActionMask::SYNTH,
            "builtin:vcl_purge",
            body(|_ctx, _prog| Ok(VclAction::Synth)),
        )
        .define(
            "vcl_miss",
            MethodMask::MISS,
            ActionMask::FETCH,
            "builtin:vcl_miss",
            body(|_ctx, _prog| Ok(VclAction::Fetch)),
        )
        .define(
            "vcl_hit",
            MethodMask::HIT,
            ActionMask::DELIVER,
            "builtin:vcl_hit",
            body(|_ctx, _prog| Ok(VclAction::Deliver)),
        )
        .define(
            "vcl_deliver",
            MethodMask::DELIVER,
            ActionMask::DELIVER,
            "builtin:vcl_deliver",
            body(|_ctx, _prog| Ok(VclAction::Deliver)),
        )
        .define(
            "vcl_synth",
            MethodMask::SYNTH,
            ActionMask::DELIVER,
            "builtin:vcl_synth",
            body(|_ctx, _prog| Ok(VclAction::Deliver)),
        )
        .define(
            "vcl_backend_fetch",
            MethodMask::BACKEND_FETCH,
            ActionMask::FETCH,
            "builtin:vcl_backend_fetch",
            body(|ctx, _prog| {
                // A conditional pair from the client must not steer the
                // backend transaction; the core injects its own when it
                // holds a stale object.
                ctx.unset_bereq_header("if-none-match")?;
                ctx.unset_bereq_header("if-modified-since")?;
                Ok(VclAction::Fetch)
            }),
        )
        .define(
            "vcl_backend_response",
            MethodMask::BACKEND_RESPONSE,
            ActionMask::DELIVER | ActionMask::PASS,
            "builtin:vcl_backend_response",
            body(|_ctx, _prog| Ok(VclAction::Deliver)),
        )
        .define(
            "vcl_backend_error",
            MethodMask::BACKEND_ERROR,
            ActionMask::DELIVER,
            "builtin:vcl_backend_error",
            body(|_ctx, _prog| Ok(VclAction::Deliver)),
        )
        .build()
        .expect("builtin program is well-formed")
}
