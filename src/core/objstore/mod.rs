// src/core/objstore/mod.rs

//! The content-addressed object store with request coalescing.
//!
//! Lookup walks the digest's bucket under its lock, drains dead objects,
//! matches vary, applies bans, classifies freshness, and either returns a
//! usable object, parks the request behind an in-flight fetch, or inserts a
//! busy placeholder making the caller the fetcher.

pub mod boc;
pub mod objcore;
pub mod objhead;
pub mod vary;

use crate::core::CitrineError;
use crate::core::ban::{BanEngine, BanVerdict};
use crate::core::expiry::ExpCmd;
use crate::core::http::HttpMsg;
use crate::core::metrics;
use crate::core::storage::stevedore::{Stevedore, StevedoreSet};
use crate::core::vsl::Vxid;
use boc::Boc;
use bytes::Bytes;
use dashmap::DashMap;
use objcore::{Freshness, ObjCore, OcFlags};
use objhead::{ObjHead, OhWaiter};
use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// The 32-byte request fingerprint used as the hash key.
pub type Digest = [u8; 32];

/// Accumulates the canonical byte strings produced by the directive hash
/// phase into the request fingerprint.
#[derive(Debug, Default)]
pub struct HashAccum {
    hasher: Sha256,
}

impl HashAccum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one canonical byte string, length-delimited so concatenations
    /// cannot collide.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update((data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Digest {
        self.hasher.finalize().into()
    }
}

/// A miss in the hands of its fetcher: the busy placeholder, the BOC, and
/// the stale object available for conditional refresh.
#[derive(Debug)]
pub struct MissHandle {
    pub digest: Digest,
    pub oc: Arc<ObjCore>,
    pub boc: Arc<Boc>,
    /// A keepable or graceable object for a conditional backend request.
    /// The handle owns one reference.
    pub stale: Option<Arc<ObjCore>>,
    /// Set on hit-for-miss: fetch without coalescing, store uncacheably.
    pub uncacheable: bool,
    /// False when the placeholder is not linked into the bucket (hit-for-miss
    /// and `hash_ignore_busy` fetches coalesce nobody).
    pub coalescing: bool,
}

/// The outcome of an object-store lookup.
#[derive(Debug)]
pub enum Lookup {
    /// A usable object; the caller owns one reference.
    Hit {
        oc: Arc<ObjCore>,
        /// True when the object is past TTL and served under grace.
        graced: bool,
        /// A revalidation miss to run in the background, present when a
        /// graced hit had no fetch in flight.
        bgfetch: Option<MissHandle>,
    },
    /// No usable object; the caller becomes the fetcher.
    Miss(MissHandle),
    /// A hit-for-pass object: bypass the cache for this request.
    Pass { oc: Arc<ObjCore> },
    /// A fetch is in flight; the request is parked and will be woken exactly
    /// once, then must re-enter lookup.
    Wait { rx: oneshot::Receiver<()> },
}

/// Parameters a request brings to lookup.
#[derive(Debug)]
pub struct LookupParams<'a> {
    pub digest: Digest,
    pub req: &'a HttpMsg,
    pub xid: Vxid,
    /// The request's own bound on acceptable staleness.
    pub grace_limit: Option<Duration>,
    /// Do not park behind a busy object; fetch independently.
    pub hash_ignore_busy: bool,
}

/// The digest-keyed object store.
#[derive(Debug)]
pub struct ObjStore {
    heads: DashMap<Digest, Arc<ObjHead>>,
    next_oc_id: AtomicU64,
    n_objects: AtomicU64,
    pub bans: Arc<BanEngine>,
    pub stevedores: StevedoreSet,
    exp_tx: once_cell::sync::OnceCell<mpsc::Sender<ExpCmd>>,
    /// Minimum interval between LRU touches for one object.
    lru_timeout: Duration,
}

impl ObjStore {
    pub fn new(bans: Arc<BanEngine>, stevedores: StevedoreSet, lru_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            heads: DashMap::new(),
            next_oc_id: AtomicU64::new(1),
            n_objects: AtomicU64::new(0),
            bans,
            stevedores,
            exp_tx: once_cell::sync::OnceCell::new(),
            lru_timeout,
        })
    }

    /// Wires up the expiry mailbox. Called once during server init.
    pub fn set_expiry(&self, tx: mpsc::Sender<ExpCmd>) {
        let _ = self.exp_tx.set(tx);
    }

    fn exp_send(&self, cmd: ExpCmd) {
        if let Some(tx) = self.exp_tx.get()
            && tx.try_send(cmd).is_err()
        {
            debug!("expiry mailbox congested, command dropped");
        }
    }

    fn new_oc_id(&self) -> u64 {
        self.next_oc_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn object_count(&self) -> usize {
        self.n_objects.load(Ordering::Relaxed) as usize
    }

    fn count_linked(&self, delta: i64) {
        if delta >= 0 {
            self.n_objects.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            self.n_objects.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
        metrics::CACHED_OBJECTS.set(self.n_objects.load(Ordering::Relaxed) as f64);
    }

    /// Runs `f` over every object core in the store. Used by the ban lurker.
    pub fn for_each_oc(&self, mut f: impl FnMut(&Arc<ObjCore>)) {
        for head in self.heads.iter() {
            let snapshot = head.inner.lock().objs.clone();
            for oc in &snapshot {
                f(oc);
            }
        }
    }

    /// The lookup algorithm of the coalescing cache.
    pub fn lookup(&self, p: LookupParams<'_>) -> Lookup {
        let oh = self
            .heads
            .entry(p.digest)
            .or_insert_with(|| ObjHead::new(p.digest))
            .clone();
        let now = SystemTime::now();

        let mut kill_list: Vec<Arc<ObjCore>> = Vec::new();
        let lookup = {
            let mut inner = oh.inner.lock();

            let mut busy_found = false;
            let mut fresh_best: Option<Arc<ObjCore>> = None;
            let mut graced_best: Option<Arc<ObjCore>> = None;
            let mut keep_best: Option<Arc<ObjCore>> = None;
            let mut pass_oc: Option<Arc<ObjCore>> = None;
            let mut hitmiss = false;

            for oc in inner.objs.iter() {
                if oc.is_unusable() {
                    // Whoever claims DYING owns the cleanup; we only skip.
                    continue;
                }
                if oc.is_busy() {
                    // A busy object's vary is unknown until the fetcher has
                    // seen the response; match against it when published.
                    if let Some(v) = oc.boc().and_then(|b| b.vary())
                        && !vary::matches(&v, p.req)
                    {
                        continue;
                    }
                    busy_found = true;
                    continue;
                }
                if let Some(v) = oc.vary()
                    && !vary::matches(&v, p.req)
                {
                    continue;
                }
                match self.bans.check_oc(oc, Some(p.req)) {
                    BanVerdict::Hit => {
                        oc.set_flags(OcFlags::PURGED);
                        if oc.set_flag_once(OcFlags::DYING) {
                            kill_list.push(oc.clone());
                        }
                        continue;
                    }
                    BanVerdict::Clean | BanVerdict::Deferred => {}
                }
                match oc.freshness(now, p.grace_limit) {
                    Freshness::Fresh => {
                        let flags = oc.flags();
                        if flags.contains(OcFlags::HFP) {
                            pass_oc.get_or_insert_with(|| oc.clone());
                        } else if flags.contains(OcFlags::HFM) {
                            hitmiss = true;
                        } else if newer(&fresh_best, oc) {
                            fresh_best = Some(oc.clone());
                        }
                    }
                    Freshness::Graceable => {
                        if newer(&graced_best, oc) {
                            graced_best = Some(oc.clone());
                        }
                    }
                    Freshness::Keepable => {
                        if newer(&keep_best, oc) {
                            keep_best = Some(oc.clone());
                        }
                    }
                    Freshness::Dead => {
                        if oc.set_flag_once(OcFlags::DYING) {
                            kill_list.push(oc.clone());
                        }
                    }
                }
            }
            inner.objs.retain(|oc| !oc.is_dying());

            if let Some(oc) = fresh_best {
                oc.take_ref();
                oc.hits.fetch_add(1, Ordering::Relaxed);
                self.touch_lru(&oc);
                Lookup::Hit {
                    oc,
                    graced: false,
                    bgfetch: None,
                }
            } else if let Some(oc) = pass_oc {
                oc.take_ref();
                Lookup::Pass { oc }
            } else if hitmiss {
                // The cached decision is to skip coalescing: an unlinked
                // placeholder, stored uncacheably.
                Lookup::Miss(self.make_miss(&oh, &mut inner, p.xid, now, None, true, false))
            } else if let Some(oc) = graced_best {
                oc.take_ref();
                oc.hits.fetch_add(1, Ordering::Relaxed);
                self.touch_lru(&oc);
                metrics::CACHE_GRACE_HITS_TOTAL.inc();
                // Schedule a revalidation fetch unless one is in flight.
                let bgfetch = if busy_found {
                    None
                } else {
                    oc.take_ref();
                    Some(self.make_miss(
                        &oh,
                        &mut inner,
                        p.xid,
                        now,
                        Some(oc.clone()),
                        false,
                        true,
                    ))
                };
                Lookup::Hit {
                    oc,
                    graced: true,
                    bgfetch,
                }
            } else if busy_found && !p.hash_ignore_busy {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push(OhWaiter {
                    vxid: p.xid,
                    waker: tx,
                });
                metrics::COALESCED_WAITS_TOTAL.inc();
                Lookup::Wait { rx }
            } else {
                let stale = keep_best.inspect(|oc| oc.take_ref());
                let coalescing = !p.hash_ignore_busy;
                Lookup::Miss(self.make_miss(&oh, &mut inner, p.xid, now, stale, false, coalescing))
            }
        };

        for oc in kill_list {
            self.finish_kill(&oc);
        }
        lookup
    }

    /// Creates the busy placeholder for a miss, linking it into the bucket
    /// when the miss coalesces.
    #[allow(clippy::too_many_arguments)]
    fn make_miss(
        &self,
        oh: &Arc<ObjHead>,
        inner: &mut objhead::OhInner,
        xid: Vxid,
        now: SystemTime,
        stale: Option<Arc<ObjCore>>,
        uncacheable: bool,
        coalescing: bool,
    ) -> MissHandle {
        let oc = ObjCore::new_busy(self.new_oc_id(), xid, now);
        let boc = Arc::new(Boc::new());
        oc.set_boc(boc.clone());
        oc.set_ban_ref(self.bans.head());
        if coalescing {
            oc.set_objhead(oh);
            inner.objs.push(oc.clone());
            self.count_linked(1);
        }
        metrics::CACHE_MISSES_TOTAL.inc();
        MissHandle {
            digest: oh.digest,
            oc,
            boc,
            stale,
            uncacheable,
            coalescing,
        }
    }

    /// Creates an unlinked busy placeholder for a pass fetch: no digest, no
    /// coalescing, never cached.
    pub fn private_miss(&self, xid: Vxid) -> MissHandle {
        let oc = ObjCore::new_busy(self.new_oc_id(), xid, SystemTime::now());
        oc.set_flags(OcFlags::PRIVATE);
        let boc = Arc::new(Boc::new());
        oc.set_boc(boc.clone());
        oc.set_ban_ref(self.bans.head());
        MissHandle {
            digest: [0u8; 32],
            oc,
            boc,
            stale: None,
            uncacheable: true,
            coalescing: false,
        }
    }

    /// Clears the busy flag and wakes the waiting list. The fetcher calls
    /// this as soon as the object is examinable (or failed).
    pub fn unbusy(&self, handle: &MissHandle) {
        let oc = &handle.oc;
        oc.clear_flags(OcFlags::BUSY);
        oc.set_vary(handle.boc.vary());
        if let Some(oh) = oc.objhead() {
            oh.rush_waiters();
        }
        if oc.objhead().is_some() && !oc.is_unusable() {
            self.exp_send(ExpCmd::Insert(oc.clone()));
            if let Some(stv) = oc.stevedore() {
                stv.lru_insert(oc);
            }
        }
    }

    /// Links a fetched non-coalescing object into its bucket, replacing any
    /// hit-for-miss decision object it supersedes.
    pub fn link_fetched(&self, handle: &MissHandle) {
        let oh = self
            .heads
            .entry(handle.digest)
            .or_insert_with(|| ObjHead::new(handle.digest))
            .clone();
        let mut kill_list = Vec::new();
        {
            let mut inner = oh.inner.lock();
            for oc in inner.objs.iter() {
                if oc.flags().contains(OcFlags::HFM) && oc.set_flag_once(OcFlags::DYING) {
                    kill_list.push(oc.clone());
                }
            }
            inner.objs.retain(|oc| !oc.is_dying());
            handle.oc.set_objhead(&oh);
            inner.objs.push(handle.oc.clone());
            self.count_linked(1);
        }
        for oc in kill_list {
            self.finish_kill(&oc);
        }
    }

    /// Takes an extra reference for a new sharer of the object.
    pub fn ref_oc(&self, oc: &Arc<ObjCore>) {
        oc.take_ref();
    }

    /// Drops a reference; the storage is released with the last one.
    pub fn deref_oc(&self, oc: &Arc<ObjCore>) {
        if oc.drop_ref() == 0 {
            oc.release_storage();
        }
    }

    /// Removes a core from the cache: bucket, LRU and expiry heap. The
    /// cache's own reference is dropped; sharers keep theirs.
    pub fn kill(&self, oc: &Arc<ObjCore>) {
        if !oc.set_flag_once(OcFlags::DYING) {
            return;
        }
        if let Some(oh) = oc.objhead() {
            // May already be unlinked by a concurrent lookup drain.
            oh.remove_oc(oc);
        }
        self.finish_kill(oc);
    }

    /// Cleanup for a core already unlinked from its bucket.
    fn finish_kill(&self, oc: &Arc<ObjCore>) {
        if let Some(stv) = oc.stevedore() {
            stv.lru_remove(oc);
        }
        if oc.timer_idx() != objcore::TIMER_IDX_NONE {
            self.exp_send(ExpCmd::Remove(oc.clone()));
        }
        if oc.objhead().is_some() {
            self.count_linked(-1);
        }
        self.deref_oc(oc);
    }

    /// Evicts every version under a digest. Returns the number of objects
    /// dropped.
    pub fn purge_digest(&self, digest: &Digest) -> usize {
        let Some(oh) = self.heads.get(digest).map(|h| h.clone()) else {
            return 0;
        };
        let mut kill_list = Vec::new();
        {
            let mut inner = oh.inner.lock();
            for oc in inner.objs.iter() {
                if !oc.is_busy() {
                    oc.set_flags(OcFlags::PURGED);
                    if oc.set_flag_once(OcFlags::DYING) {
                        kill_list.push(oc.clone());
                    }
                }
            }
            inner.objs.retain(|oc| !oc.is_dying());
        }
        let n = kill_list.len();
        for oc in kill_list {
            self.finish_kill(&oc);
        }
        n
    }

    /// Changes an object's freshness parameters and re-keys its expiry heap
    /// entry.
    pub fn update_ttl(&self, oc: &Arc<ObjCore>, ttl: objcore::OcTtl) {
        oc.set_ttl_state(ttl);
        self.exp_send(ExpCmd::Rejuvenate(oc.clone()));
    }

    /// Rate-limited LRU touch, routed through the expiry mailbox.
    fn touch_lru(&self, oc: &Arc<ObjCore>) {
        if oc.last_lru().elapsed() >= self.lru_timeout {
            oc.set_last_lru(std::time::Instant::now());
            self.exp_send(ExpCmd::TouchLru(oc.clone()));
        }
    }

    /// Frees space on `stv` by nuking the coldest evictable object.
    /// Returns true when an object was dropped.
    pub fn nuke_one(&self, stv: &dyn Stevedore) -> bool {
        let Some(oc) = stv.lru_candidate() else {
            return false;
        };
        debug!(oc = oc.id, "LRU-nuking object for space");
        metrics::NUKED_OBJECTS_TOTAL.inc();
        self.kill(&oc);
        true
    }
}

/// Whether `oc` has a newer origin than the current candidate.
fn newer(best: &Option<Arc<ObjCore>>, oc: &Arc<ObjCore>) -> bool {
    match best {
        None => true,
        Some(b) => oc.ttl_state().t_origin > b.ttl_state().t_origin,
    }
}

/// Serialized response header bytes for an object, for ban evaluation and
/// delivery.
pub fn obj_headers(oc: &ObjCore) -> Result<Vec<(Bytes, Bytes)>, CitrineError> {
    let obj = oc
        .obj()
        .ok_or(CitrineError::AttrMissing("headers"))?;
    crate::core::http::decode_headers(&obj.attrs().headers)
}
