// src/core/storage/stevedore.rs

//! Stevedores: the object allocators behind the cache.
//!
//! A stevedore accounts body bytes against a budget and keeps the LRU list
//! the expiry engine nukes from under memory pressure. The default set is one
//! malloc-backed main store plus a transient store for shortlived and private
//! objects; transient objects never become nuke candidates.

use crate::core::CitrineError;
use crate::core::objstore::objcore::ObjCore;
use crate::core::storage::object::StoredObject;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// The allocator capability the cache core sees.
pub trait Stevedore: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Allocates a fresh stored object. Fails when the budget is exhausted
    /// and nothing could be nuked.
    fn alloc_obj(&self) -> Result<Arc<StoredObject>, CitrineError>;

    /// Charges `n` body bytes against the budget. Fails when the budget
    /// cannot cover them.
    fn charge(&self, n: u64) -> Result<(), CitrineError>;

    /// Returns `n` bytes to the budget.
    fn credit(&self, n: u64);

    /// Moves an object core to the hot end of the LRU.
    fn lru_touch(&self, oc: &Arc<ObjCore>);

    /// Inserts a finished object core into the LRU.
    fn lru_insert(&self, oc: &Arc<ObjCore>);

    /// Drops an object core from the LRU.
    fn lru_remove(&self, oc: &Arc<ObjCore>);

    /// Returns the coldest nukeable candidate, skipping cores still
    /// referenced outside the cache. Skipped cores are re-queued hot.
    fn lru_candidate(&self) -> Option<Arc<ObjCore>>;

    fn used_bytes(&self) -> u64;

    fn capacity(&self) -> u64;
}

/// The malloc stevedore: objects live on the heap, accounted against a fixed
/// byte budget.
pub struct MallocStevedore {
    name: &'static str,
    capacity: u64,
    used: AtomicU64,
    /// Keyed by core id; eviction pressure pops from the cold end.
    lru: Mutex<LruCache<u64, Arc<ObjCore>>>,
    /// Transient stores never offer nuke candidates.
    nukeable: bool,
}

impl std::fmt::Debug for MallocStevedore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MallocStevedore")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("nukeable", &self.nukeable)
            .finish()
    }
}

impl MallocStevedore {
    pub fn new(name: &'static str, capacity: u64, nukeable: bool) -> Self {
        Self {
            name,
            capacity,
            used: AtomicU64::new(0),
            lru: Mutex::new(LruCache::unbounded()),
            nukeable,
        }
    }
}

impl Stevedore for MallocStevedore {
    fn name(&self) -> &'static str {
        self.name
    }

    fn alloc_obj(&self) -> Result<Arc<StoredObject>, CitrineError> {
        Ok(Arc::new(StoredObject::new()))
    }

    fn charge(&self, n: u64) -> Result<(), CitrineError> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used + n > self.capacity {
                return Err(CitrineError::StorageFull);
            }
            match self.used.compare_exchange_weak(
                used,
                used + n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(cur) => used = cur,
            }
        }
    }

    fn credit(&self, n: u64) {
        self.used.fetch_sub(n, Ordering::Relaxed);
    }

    fn lru_touch(&self, oc: &Arc<ObjCore>) {
        // `get` promotes the entry to the hot end.
        self.lru.lock().get(&oc.id);
        oc.set_last_lru(Instant::now());
    }

    fn lru_insert(&self, oc: &Arc<ObjCore>) {
        oc.set_last_lru(Instant::now());
        self.lru.lock().put(oc.id, oc.clone());
    }

    fn lru_remove(&self, oc: &Arc<ObjCore>) {
        self.lru.lock().pop(&oc.id);
    }

    fn lru_candidate(&self) -> Option<Arc<ObjCore>> {
        if !self.nukeable {
            return None;
        }
        let mut lru = self.lru.lock();
        // Bounded scan: skip cores with live deliverers, putting them back hot.
        for _ in 0..lru.len().min(64) {
            let (id, oc) = lru.pop_lru()?;
            if oc.refcnt() > 1 || oc.is_busy() {
                lru.put(id, oc);
                continue;
            }
            return Some(oc);
        }
        None
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// The configured stevedore pair: the main cache store and the transient
/// store used for shortlived, private and synthetic objects.
#[derive(Debug, Clone)]
pub struct StevedoreSet {
    pub main: Arc<MallocStevedore>,
    pub transient: Arc<MallocStevedore>,
}

impl StevedoreSet {
    pub fn new(main_capacity: u64, transient_capacity: u64) -> Self {
        Self {
            main: Arc::new(MallocStevedore::new("s0", main_capacity, true)),
            transient: Arc::new(MallocStevedore::new("transient", transient_capacity, false)),
        }
    }

    /// Picks the stevedore for an object with the given expected lifetime.
    pub fn select(&self, shortlived: bool) -> Arc<MallocStevedore> {
        if shortlived {
            self.transient.clone()
        } else {
            self.main.clone()
        }
    }
}
