use bytes::Bytes;
use citrine::core::CitrineError;
use citrine::core::http::HttpMsg;
use citrine::core::vcl::privs::TaskPrivs;
use citrine::core::vcl::{
    ActionMask, MethodMask, VclAction, VclCtx, VclMethod, VclProgram, builtin_program, call_sub,
    dispatch,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

fn get_req(url: &str) -> HttpMsg {
    let mut req = HttpMsg::new_request(b"GET", url.as_bytes(), b"HTTP/1.1");
    req.set("host", &b"h"[..]);
    req
}

#[test]
fn test_builtin_recv_policy() {
    let prog = builtin_program();
    let now = SystemTime::now();

    let mut req = get_req("/x");
    let mut ctx = VclCtx::new(VclMethod::Recv, now).with_req(&mut req);
    assert_eq!(
        dispatch(&prog, &mut ctx, VclMethod::Recv).unwrap(),
        VclAction::Lookup
    );

    let mut post = HttpMsg::new_request(b"POST", b"/x", b"HTTP/1.1");
    let mut ctx = VclCtx::new(VclMethod::Recv, now).with_req(&mut post);
    assert_eq!(
        dispatch(&prog, &mut ctx, VclMethod::Recv).unwrap(),
        VclAction::Pass
    );

    let mut with_cookie = get_req("/x");
    with_cookie.set("cookie", &b"session=1"[..]);
    let mut ctx = VclCtx::new(VclMethod::Recv, now).with_req(&mut with_cookie);
    assert_eq!(
        dispatch(&prog, &mut ctx, VclMethod::Recv).unwrap(),
        VclAction::Pass
    );

    let mut purge = HttpMsg::new_request(b"PURGE", b"/x", b"HTTP/1.1");
    let mut ctx = VclCtx::new(VclMethod::Recv, now).with_req(&mut purge);
    assert_eq!(
        dispatch(&prog, &mut ctx, VclMethod::Recv).unwrap(),
        VclAction::Purge
    );
}

#[test]
fn test_builtin_hash_feeds_url_and_host() {
    use citrine::core::objstore::HashAccum;
    let prog = builtin_program();
    let now = SystemTime::now();

    let mut req = get_req("/same");
    let mut accum = HashAccum::new();
    let mut ctx = VclCtx::new(VclMethod::Hash, now)
        .with_req(&mut req)
        .with_hash(&mut accum);
    assert_eq!(
        dispatch(&prog, &mut ctx, VclMethod::Hash).unwrap(),
        VclAction::Lookup
    );
    let d1 = accum.finalize();

    let mut req = get_req("/other");
    let mut accum = HashAccum::new();
    let mut ctx = VclCtx::new(VclMethod::Hash, now)
        .with_req(&mut req)
        .with_hash(&mut accum);
    dispatch(&prog, &mut ctx, VclMethod::Hash).unwrap();
    let d2 = accum.finalize();
    assert_ne!(d1, d2);
}

#[test]
fn test_illegal_return_is_rejected() {
    // A sub whose body answers something its own returns mask forbids.
    let prog = VclProgram::builder("t")
        .define(
            "vcl_recv",
            MethodMask::RECV,
            ActionMask::LOOKUP,
            "test",
            Arc::new(|_ctx: &mut VclCtx<'_>, _p: &VclProgram| Ok(VclAction::Pass)),
        )
        .build()
        .unwrap();
    let mut req = get_req("/x");
    let mut ctx = VclCtx::new(VclMethod::Recv, SystemTime::now()).with_req(&mut req);
    let err = dispatch(&prog, &mut ctx, VclMethod::Recv).unwrap_err();
    assert!(matches!(err, CitrineError::IllegalReturn { .. }));

    // A disposition outside the method's legal set is rejected even when the
    // sub's mask allows it.
    let prog = VclProgram::builder("t2")
        .define(
            "vcl_hash",
            MethodMask::HASH,
            ActionMask::LOOKUP | ActionMask::RESTART,
            "test",
            Arc::new(|_ctx: &mut VclCtx<'_>, _p: &VclProgram| Ok(VclAction::Restart)),
        )
        .build()
        .unwrap();
    let mut req = get_req("/x");
    let mut ctx = VclCtx::new(VclMethod::Hash, SystemTime::now()).with_req(&mut req);
    assert!(matches!(
        dispatch(&prog, &mut ctx, VclMethod::Hash).unwrap_err(),
        CitrineError::IllegalReturn { .. }
    ));
}

#[test]
fn test_recursion_is_detected() {
    let prog = VclProgram::builder("rec")
        .define(
            "vcl_recv",
            MethodMask::RECV,
            ActionMask::LOOKUP,
            "test",
            Arc::new(|ctx: &mut VclCtx<'_>, prog: &VclProgram| {
                // Indirectly re-enter ourselves.
                let me = prog.sub_idx("vcl_recv").unwrap();
                call_sub(prog, ctx, me)
            }),
        )
        .build()
        .unwrap();
    let mut req = get_req("/x");
    let mut ctx = VclCtx::new(VclMethod::Recv, SystemTime::now()).with_req(&mut req);
    assert!(matches!(
        dispatch(&prog, &mut ctx, VclMethod::Recv).unwrap_err(),
        CitrineError::VclRecursion(_)
    ));
}

#[test]
fn test_sub_call_graph_without_recursion_is_fine() {
    let prog = VclProgram::builder("call")
        .define(
            "helper",
            MethodMask::RECV,
            ActionMask::LOOKUP,
            "test",
            Arc::new(|ctx: &mut VclCtx<'_>, _p: &VclProgram| {
                ctx.set_req_header("x-seen", "yes")?;
                Ok(VclAction::Lookup)
            }),
        )
        .define(
            "vcl_recv",
            MethodMask::RECV,
            ActionMask::LOOKUP,
            "test",
            Arc::new(|ctx: &mut VclCtx<'_>, prog: &VclProgram| {
                let helper = prog.sub_idx("helper").unwrap();
                call_sub(prog, ctx, helper)
            }),
        )
        .build()
        .unwrap();
    let mut req = get_req("/x");
    let mut ctx = VclCtx::new(VclMethod::Recv, SystemTime::now()).with_req(&mut req);
    assert_eq!(
        dispatch(&prog, &mut ctx, VclMethod::Recv).unwrap(),
        VclAction::Lookup
    );
    assert_eq!(req.get_str("x-seen"), Some("yes"));
}

#[test]
fn test_sub_not_callable_from_wrong_method() {
    let prog = VclProgram::builder("m")
        .define(
            "backend_only",
            MethodMask::BACKEND_RESPONSE,
            ActionMask::DELIVER,
            "test",
            Arc::new(|_ctx: &mut VclCtx<'_>, _p: &VclProgram| Ok(VclAction::Deliver)),
        )
        .define(
            "vcl_recv",
            MethodMask::RECV,
            ActionMask::LOOKUP,
            "test",
            Arc::new(|ctx: &mut VclCtx<'_>, prog: &VclProgram| {
                let idx = prog.sub_idx("backend_only").unwrap();
                call_sub(prog, ctx, idx)
            }),
        )
        .build()
        .unwrap();
    let mut req = get_req("/x");
    let mut ctx = VclCtx::new(VclMethod::Recv, SystemTime::now()).with_req(&mut req);
    assert!(dispatch(&prog, &mut ctx, VclMethod::Recv).is_err());
}

#[test]
fn test_accessor_legality_is_method_scoped() {
    let mut req = get_req("/x");
    let mut ctx = VclCtx::new(VclMethod::Recv, SystemTime::now()).with_req(&mut req);
    // beresp is not readable from recv, regardless of attachment.
    assert!(ctx.beresp_status().is_err());
    // hash_data is hash-only.
    assert!(ctx.hash_data(b"x").is_err());
    // req is fine.
    assert!(ctx.req_url().is_ok());
}

#[test]
fn test_explicit_fail_cannot_be_caught() {
    let prog = VclProgram::builder("f")
        .define(
            "vcl_recv",
            MethodMask::RECV,
            ActionMask::LOOKUP,
            "test",
            Arc::new(|ctx: &mut VclCtx<'_>, _p: &VclProgram| {
                ctx.fail();
                Ok(VclAction::Lookup)
            }),
        )
        .build()
        .unwrap();
    let mut req = get_req("/x");
    let mut ctx = VclCtx::new(VclMethod::Recv, SystemTime::now()).with_req(&mut req);
    assert!(matches!(
        dispatch(&prog, &mut ctx, VclMethod::Recv).unwrap_err(),
        CitrineError::VclFailure(_)
    ));
}

#[test]
fn test_task_privs_run_finalizers_in_reverse_order() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let mut privs = TaskPrivs::new();
        for id in 1..=3u64 {
            let order = order.clone();
            privs.set(
                id,
                Box::new(id),
                Some(Box::new(move |_data| {
                    order.lock().unwrap().push(id);
                })),
            );
        }
        assert_eq!(privs.len(), 3);
        assert!(privs.get(2).is_some());
    }
    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
}

#[test]
fn test_task_priv_replacement_finalizes_old_value() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    let mut privs = TaskPrivs::new();
    privs.set(
        7,
        Box::new(Bytes::from_static(b"old")),
        Some(Box::new(|_| {
            DROPS.fetch_add(1, Ordering::SeqCst);
        })),
    );
    privs.set(7, Box::new(Bytes::from_static(b"new")), None);
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    let v = privs
        .get(7)
        .and_then(|d| d.downcast_ref::<Bytes>())
        .unwrap();
    assert_eq!(v.as_ref(), b"new");
}
