// src/core/objstore/objhead.rs

//! The object head: one hash bucket, keyed by the request digest.
//!
//! The head mutex serializes the object list, busy-object insertion and the
//! waiting list. Wakeups are delivered through oneshot channels after the
//! lock is dropped, so a woken request never sees the head lock held across
//! its own work.

use crate::core::objstore::Digest;
use crate::core::objstore::objcore::ObjCore;
use crate::core::vsl::Vxid;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A request parked on the bucket, woken exactly once.
#[derive(Debug)]
pub struct OhWaiter {
    pub vxid: Vxid,
    pub waker: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
pub struct OhInner {
    /// The cache versions under this digest, distinguished by vary.
    pub objs: Vec<Arc<ObjCore>>,
    /// Requests blocked on the busy object.
    pub waiters: Vec<OhWaiter>,
}

/// One hash bucket.
#[derive(Debug)]
pub struct ObjHead {
    pub digest: Digest,
    pub inner: Mutex<OhInner>,
}

impl ObjHead {
    pub fn new(digest: Digest) -> Arc<Self> {
        Arc::new(Self {
            digest,
            inner: Mutex::new(OhInner::default()),
        })
    }

    /// Removes one core from the bucket. Returns true when it was present.
    pub fn remove_oc(&self, oc: &Arc<ObjCore>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.objs.len();
        inner.objs.retain(|c| !Arc::ptr_eq(c, oc));
        inner.objs.len() != before
    }

    /// Takes the whole waiting list for waking. Callers signal after
    /// dropping the head lock.
    pub fn take_waiters(&self) -> Vec<OhWaiter> {
        std::mem::take(&mut self.inner.lock().waiters)
    }

    /// Wakes every parked request exactly once. Receivers that went away
    /// (client abort) are skipped silently.
    pub fn rush_waiters(&self) {
        for w in self.take_waiters() {
            let _ = w.waker.send(());
        }
    }
}
