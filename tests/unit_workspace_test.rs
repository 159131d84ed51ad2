use citrine::core::workspace::Workspace;

#[test]
fn test_alloc_returns_distinct_aligned_regions() {
    let mut ws = Workspace::new("tst", 256);
    let a = ws.alloc(3).unwrap();
    let b = ws.alloc(5).unwrap();
    assert_eq!(a.len(), 3);
    assert_eq!(b.offset() % std::mem::size_of::<usize>(), 0);

    ws.slice_mut(&a).copy_from_slice(b"abc");
    ws.slice_mut(&b).copy_from_slice(b"defgh");
    assert_eq!(ws.slice(&a), b"abc");
    assert_eq!(ws.slice(&b), b"defgh");
}

#[test]
fn test_copy_preserves_content() {
    let mut ws = Workspace::new("tst", 128);
    let tok = ws.copy(b"hello workspace").unwrap();
    assert_eq!(ws.slice(&tok), b"hello workspace");
}

#[test]
fn test_overflow_is_sticky_until_full_reset() {
    let mut ws = Workspace::new("tst", 32);
    let base = ws.snapshot();
    ws.alloc(8).unwrap();
    let mid = ws.snapshot();

    assert!(ws.alloc(1024).is_err());
    assert!(ws.overflowed());

    // Still poisoned after a partial reset.
    ws.reset(mid);
    assert!(ws.alloc(1).is_err());

    // Cleared by a reset to the initial mark.
    ws.reset(base);
    assert!(!ws.overflowed());
    assert!(ws.alloc(8).is_ok());
}

#[test]
fn test_allocations_before_snapshot_survive_reset() {
    let mut ws = Workspace::new("tst", 128);
    let early = ws.copy(b"keep me").unwrap();
    let mark = ws.snapshot();
    ws.copy(b"scratch").unwrap();
    ws.reset(mark);
    assert_eq!(ws.slice(&early), b"keep me");
    // Space after the mark is reusable.
    assert!(ws.alloc(32).is_ok());
}

#[test]
fn test_single_reservation_window() {
    let mut ws = Workspace::new("tst", 64);
    let usable = ws.reserve(None).unwrap();
    assert_eq!(usable, 64);
    // Only one reservation may be outstanding.
    assert!(ws.reserve(None).is_err());

    ws.reservation_write(0, b"hello").unwrap();
    let tok = ws.release(5).unwrap();
    assert_eq!(ws.slice(&tok), b"hello");

    // A new reservation is legal again after release.
    assert!(ws.reserve(Some(16)).is_ok());
    let tok = ws.release(0).unwrap();
    assert!(tok.is_empty());
}

#[test]
fn test_reserve_beyond_capacity_overflows() {
    let mut ws = Workspace::new("tst", 16);
    assert!(ws.reserve(Some(64)).is_err());
    assert!(ws.overflowed());
}

#[test]
fn test_alloc_during_reservation_is_rejected() {
    let mut ws = Workspace::new("tst", 64);
    ws.reserve(Some(16)).unwrap();
    assert!(ws.alloc(8).is_err());
    // The reservation itself is still usable.
    ws.release(4).unwrap();
    assert!(ws.alloc(8).is_ok());
}
