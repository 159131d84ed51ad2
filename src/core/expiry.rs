// src/core/expiry.rs

//! The expiry engine: a single background task owning a min-heap keyed by
//! effective expiry time, plus the LRU touch path.
//!
//! All heap surgery goes through the engine's mailbox, so `timer_idx` on an
//! object core is written by exactly one task. An object is never visible to
//! lookup after its expiry is published: the kill removes it from its bucket
//! before storage is released.

use crate::core::metrics;
use crate::core::objstore::ObjStore;
use crate::core::objstore::objcore::{ObjCore, TIMER_IDX_NONE};
use crate::core::storage::stevedore::Stevedore;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Commands accepted by the expiry mailbox.
#[derive(Debug)]
pub enum ExpCmd {
    /// Schedule a freshly unbusied object.
    Insert(Arc<ObjCore>),
    /// Drop an object that left the cache through another path.
    Remove(Arc<ObjCore>),
    /// Re-key an object whose ttl/grace/keep changed.
    Rejuvenate(Arc<ObjCore>),
    /// Move an object to the hot end of its stevedore's LRU.
    TouchLru(Arc<ObjCore>),
}

/// Mailbox capacity; senders drop commands rather than block the data path.
const EXP_MAILBOX_CAPACITY: usize = 1024;

/// Upper bound on one sleep so clock steps are noticed promptly.
const EXP_MAX_SLEEP: Duration = Duration::from_secs(10);

struct HeapEntry {
    when: SystemTime,
    /// Insertion order breaks ties.
    seq: u64,
    oc: Arc<ObjCore>,
}

impl HeapEntry {
    fn key(&self) -> (SystemTime, u64) {
        (self.when, self.seq)
    }
}

/// The expiry engine. Owns the heap; shared state is reached through the
/// object store.
pub struct ExpiryEngine {
    store: Arc<ObjStore>,
    heap: Vec<HeapEntry>,
    next_seq: u64,
    rx: Option<mpsc::Receiver<ExpCmd>>,
    /// Clock steps beyond this are logged and clamped.
    clock_step: Duration,
    last_now: SystemTime,
}

impl ExpiryEngine {
    /// Creates the engine and the mailbox sender the store publishes to.
    pub fn new(store: Arc<ObjStore>, clock_step: Duration) -> (Self, mpsc::Sender<ExpCmd>) {
        let (tx, rx) = mpsc::channel(EXP_MAILBOX_CAPACITY);
        (
            Self {
                store,
                heap: Vec::new(),
                next_seq: 0,
                rx: Some(rx),
                clock_step,
                last_now: SystemTime::now(),
            },
            tx,
        )
    }

    /// Runs the expiry loop until shutdown.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Expiry engine started.");
        let mut rx = self.rx.take().expect("expiry engine runs once");
        loop {
            self.expire_due();
            let sleep = self.next_wakeup();
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { return };
                    self.handle(cmd);
                }
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown_rx.recv() => {
                    info!("Expiry engine shutting down.");
                    return;
                }
            }
        }
    }

    fn handle(&mut self, cmd: ExpCmd) {
        match cmd {
            ExpCmd::Insert(oc) => self.insert(oc),
            ExpCmd::Remove(oc) => self.remove(&oc),
            ExpCmd::Rejuvenate(oc) => self.rejuvenate(&oc),
            ExpCmd::TouchLru(oc) => {
                if let Some(stv) = oc.stevedore() {
                    stv.lru_touch(&oc);
                }
            }
        }
    }

    /// Reads the wall clock, clamping steps larger than `clock_step`.
    fn now(&mut self) -> SystemTime {
        let now = SystemTime::now();
        let stepped = match now.duration_since(self.last_now) {
            Ok(fwd) => fwd > self.clock_step + EXP_MAX_SLEEP,
            Err(back) => back.duration() > self.clock_step,
        };
        if stepped {
            warn!(
                "clock step detected ({:?} -> {:?}), clamping",
                self.last_now, now
            );
        }
        if now > self.last_now {
            self.last_now = now;
        }
        self.last_now
    }

    /// Pops and kills every object whose effective expiry has passed.
    fn expire_due(&mut self) {
        let now = self.now();
        while let Some(top) = self.heap.first() {
            if top.when > now {
                break;
            }
            let entry = self.pop_top();
            let oc = entry.oc;
            if oc.is_dying() {
                continue;
            }
            debug!(oc = oc.id, "object expired");
            metrics::EXPIRED_OBJECTS_TOTAL.inc();
            self.store.kill(&oc);
        }
    }

    fn next_wakeup(&self) -> Duration {
        match self.heap.first() {
            Some(top) => top
                .when
                .duration_since(self.last_now)
                .unwrap_or(Duration::ZERO)
                .min(EXP_MAX_SLEEP),
            None => EXP_MAX_SLEEP,
        }
    }

    fn insert(&mut self, oc: Arc<ObjCore>) {
        if oc.timer_idx() != TIMER_IDX_NONE {
            // Already scheduled; treat as a rejuvenation.
            self.rejuvenate(&oc);
            return;
        }
        let when = oc.ttl_state().timer_when();
        let seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.heap.len();
        self.heap.push(HeapEntry { when, seq, oc });
        self.heap[idx].oc.set_timer_idx(idx);
        self.sift_up(idx);
    }

    fn remove(&mut self, oc: &Arc<ObjCore>) {
        let idx = oc.timer_idx();
        if idx == TIMER_IDX_NONE || idx >= self.heap.len() {
            return;
        }
        if !Arc::ptr_eq(&self.heap[idx].oc, oc) {
            return;
        }
        oc.set_timer_idx(TIMER_IDX_NONE);
        let last = self.heap.len() - 1;
        if idx != last {
            self.heap.swap(idx, last);
            self.heap.pop();
            self.heap[idx].oc.set_timer_idx(idx);
            self.sift_down(idx);
            self.sift_up(idx);
        } else {
            self.heap.pop();
        }
    }

    /// Re-keys an entry in place after its ttl state changed.
    fn rejuvenate(&mut self, oc: &Arc<ObjCore>) {
        let idx = oc.timer_idx();
        if idx == TIMER_IDX_NONE || idx >= self.heap.len() || !Arc::ptr_eq(&self.heap[idx].oc, oc)
        {
            return;
        }
        self.heap[idx].when = oc.ttl_state().timer_when();
        self.sift_down(idx);
        self.sift_up(idx);
    }

    fn pop_top(&mut self) -> HeapEntry {
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let entry = self.heap.pop().unwrap();
        entry.oc.set_timer_idx(TIMER_IDX_NONE);
        if !self.heap.is_empty() {
            self.heap[0].oc.set_timer_idx(0);
            self.sift_down(0);
        }
        entry
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].key() >= self.heap[parent].key() {
                break;
            }
            self.heap.swap(idx, parent);
            self.heap[idx].oc.set_timer_idx(idx);
            self.heap[parent].oc.set_timer_idx(parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < self.heap.len() && self.heap[left].key() < self.heap[smallest].key() {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].key() < self.heap[smallest].key() {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.heap.swap(idx, smallest);
            self.heap[idx].oc.set_timer_idx(idx);
            self.heap[smallest].oc.set_timer_idx(smallest);
            idx = smallest;
        }
    }

    /// Test hook: number of scheduled entries.
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Test hook: drives one synchronous expiry pass.
    pub fn tick(&mut self) {
        loop {
            let Some(rx) = self.rx.as_mut() else { break };
            let Ok(cmd) = rx.try_recv() else { break };
            self.handle(cmd);
        }
        self.expire_due();
    }
}
