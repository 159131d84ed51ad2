// src/core/objstore/objcore.rs

//! The object core: per-cached-resource metadata.
//!
//! An `ObjCore` is the only cross-task handle into cached state. The owning
//! link is object-head → object-core; the LRU, the ban list and the expiry
//! heap hold back-references resolved under their own locks.

use crate::core::ban::Ban;
use crate::core::objstore::boc::Boc;
use crate::core::objstore::objhead::ObjHead;
use crate::core::storage::stevedore::{MallocStevedore, Stevedore};
use crate::core::storage::object::StoredObject;
use crate::core::vsl::Vxid;
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

bitflags! {
    /// Object core state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OcFlags: u16 {
        const PURGED  = 1 << 0;
        const BUSY    = 1 << 1;
        /// Hit-for-miss: cached decision to skip coalescing.
        const HFM     = 1 << 2;
        /// Hit-for-pass: cached decision to bypass the cache.
        const HFP     = 1 << 3;
        const ABANDON = 1 << 4;
        const PRIVATE = 1 << 5;
        const FAILED  = 1 << 6;
        const DYING   = 1 << 7;
    }
}

/// Sentinel for "not in the expiry heap".
pub const TIMER_IDX_NONE: usize = usize::MAX;

/// The freshness parameters of an object, all relative to `t_origin`.
#[derive(Debug, Clone, Copy)]
pub struct OcTtl {
    pub t_origin: SystemTime,
    pub ttl: Duration,
    pub grace: Duration,
    pub keep: Duration,
}

impl OcTtl {
    /// When the object stops being fresh.
    pub fn fresh_until(&self) -> SystemTime {
        self.t_origin + self.ttl
    }

    /// When the object stops being usable even as a stale (graced) hit.
    pub fn grace_until(&self) -> SystemTime {
        self.t_origin + self.ttl + self.grace
    }

    /// When the object stops being usable for conditional refresh.
    pub fn keep_until(&self) -> SystemTime {
        self.t_origin + self.ttl + self.keep
    }

    /// Effective expiry: the object leaves the cache when neither grace nor
    /// keep can still use it.
    pub fn timer_when(&self) -> SystemTime {
        self.grace_until().max(self.keep_until())
    }
}

/// Classification of an object against a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Graceable,
    Keepable,
    Dead,
}

#[derive(Debug)]
pub struct ObjCore {
    /// Store-unique id, used as the LRU/heap key.
    pub id: u64,
    /// Transaction that created the object.
    pub xid: Vxid,
    refcnt: AtomicU64,
    pub hits: AtomicU64,
    flags: Mutex<OcFlags>,
    ttl: Mutex<OcTtl>,
    /// Position in the expiry heap, maintained solely by the expiry engine.
    timer_idx: AtomicUsize,
    last_lru: Mutex<Instant>,
    /// The newest ban that might still apply to this object.
    ban: Mutex<Option<Arc<Ban>>>,
    oh: Mutex<Weak<ObjHead>>,
    boc: Mutex<Option<Arc<Boc>>>,
    obj: Mutex<Option<Arc<StoredObject>>>,
    stevedore: Mutex<Option<Arc<MallocStevedore>>>,
    /// Serialized vary description, set at unbusy time.
    vary: Mutex<Option<Bytes>>,
}

impl ObjCore {
    /// Creates a busy core; the creator becomes the fetcher and the cache
    /// holds the second reference.
    pub fn new_busy(id: u64, xid: Vxid, now: SystemTime) -> Arc<Self> {
        Arc::new(Self {
            id,
            xid,
            // One reference for the cache, one for the fetcher.
            refcnt: AtomicU64::new(2),
            hits: AtomicU64::new(0),
            flags: Mutex::new(OcFlags::BUSY),
            ttl: Mutex::new(OcTtl {
                t_origin: now,
                ttl: Duration::ZERO,
                grace: Duration::ZERO,
                keep: Duration::ZERO,
            }),
            timer_idx: AtomicUsize::new(TIMER_IDX_NONE),
            last_lru: Mutex::new(Instant::now()),
            ban: Mutex::new(None),
            oh: Mutex::new(Weak::new()),
            boc: Mutex::new(None),
            obj: Mutex::new(None),
            stevedore: Mutex::new(None),
            vary: Mutex::new(None),
        })
    }

    // --- Reference counting ---

    pub fn refcnt(&self) -> u64 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Takes one reference. The caller must already hold one (or the OH lock).
    pub fn take_ref(&self) {
        let prev = self.refcnt.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Drops one reference, returning the remaining count. At zero the caller
    /// must release the stored object.
    pub fn drop_ref(&self) -> u64 {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev - 1
    }

    // --- Flags ---

    pub fn flags(&self) -> OcFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, add: OcFlags) {
        self.flags.lock().insert(add);
    }

    pub fn clear_flags(&self, remove: OcFlags) {
        self.flags.lock().remove(remove);
    }

    /// Atomically sets a flag; returns false if it was already set.
    pub fn set_flag_once(&self, flag: OcFlags) -> bool {
        let mut f = self.flags.lock();
        if f.contains(flag) {
            false
        } else {
            f.insert(flag);
            true
        }
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(OcFlags::BUSY)
    }

    /// True when the core has been claimed for removal from the cache.
    pub fn is_dying(&self) -> bool {
        self.flags().contains(OcFlags::DYING)
    }

    /// True when the core must not satisfy lookups.
    pub fn is_unusable(&self) -> bool {
        self.flags()
            .intersects(OcFlags::DYING | OcFlags::PURGED | OcFlags::FAILED | OcFlags::ABANDON)
    }

    // --- Freshness ---

    pub fn ttl_state(&self) -> OcTtl {
        *self.ttl.lock()
    }

    pub fn set_ttl_state(&self, t: OcTtl) {
        *self.ttl.lock() = t;
    }

    /// Classifies the object at `now`, bounding grace by the request's own
    /// limit when given.
    pub fn freshness(&self, now: SystemTime, grace_limit: Option<Duration>) -> Freshness {
        let t = self.ttl_state();
        if now <= t.fresh_until() {
            return Freshness::Fresh;
        }
        let grace = match grace_limit {
            Some(limit) => t.grace.min(limit),
            None => t.grace,
        };
        if now <= t.fresh_until() + grace {
            return Freshness::Graceable;
        }
        if now <= t.keep_until() {
            return Freshness::Keepable;
        }
        Freshness::Dead
    }

    // --- Expiry / LRU bookkeeping ---

    pub fn timer_idx(&self) -> usize {
        self.timer_idx.load(Ordering::Relaxed)
    }

    pub fn set_timer_idx(&self, idx: usize) {
        self.timer_idx.store(idx, Ordering::Relaxed);
    }

    pub fn last_lru(&self) -> Instant {
        *self.last_lru.lock()
    }

    pub fn set_last_lru(&self, t: Instant) {
        *self.last_lru.lock() = t;
    }

    // --- Ban reference ---

    pub fn ban_ref(&self) -> Option<Arc<Ban>> {
        self.ban.lock().clone()
    }

    /// Advances the ban pointer, keeping per-ban reference counts balanced.
    pub fn set_ban_ref(&self, ban: Arc<Ban>) {
        ban.take_oc_ref();
        if let Some(old) = self.ban.lock().replace(ban) {
            old.drop_oc_ref();
        }
    }

    pub fn clear_ban_ref(&self) {
        if let Some(old) = self.ban.lock().take() {
            old.drop_oc_ref();
        }
    }

    // --- Links ---

    pub fn objhead(&self) -> Option<Arc<ObjHead>> {
        self.oh.lock().upgrade()
    }

    pub fn set_objhead(&self, oh: &Arc<ObjHead>) {
        *self.oh.lock() = Arc::downgrade(oh);
    }

    pub fn boc(&self) -> Option<Arc<Boc>> {
        self.boc.lock().clone()
    }

    pub fn set_boc(&self, boc: Arc<Boc>) {
        *self.boc.lock() = Some(boc);
    }

    /// Drops the BOC once the fetch is over; streaming deliverers keep their
    /// own handles.
    pub fn clear_boc(&self) {
        *self.boc.lock() = None;
    }

    pub fn obj(&self) -> Option<Arc<StoredObject>> {
        self.obj.lock().clone()
    }

    pub fn set_obj(&self, obj: Arc<StoredObject>, stv: Arc<MallocStevedore>) {
        *self.obj.lock() = Some(obj);
        *self.stevedore.lock() = Some(stv);
    }

    pub fn stevedore(&self) -> Option<Arc<MallocStevedore>> {
        self.stevedore.lock().clone()
    }

    pub fn vary(&self) -> Option<Bytes> {
        self.vary.lock().clone()
    }

    pub fn set_vary(&self, vary: Option<Bytes>) {
        *self.vary.lock() = vary;
    }

    /// Releases the stored body back to its stevedore. Called exactly once,
    /// when the last reference goes away.
    pub fn release_storage(&self) {
        let obj = self.obj.lock().take();
        let stv = self.stevedore.lock().take();
        if let (Some(obj), Some(stv)) = (obj, stv) {
            stv.credit(obj.get_len());
        }
        self.clear_ban_ref();
    }
}
