// src/core/objstore/boc.rs

//! The busy-object context: the shared handle coordinating one fetcher and
//! its streaming deliverers.
//!
//! State and committed length are published together through a watch channel,
//! so a deliverer always observes a consistent `(state, len)` pair and every
//! transition wakes all waiters.

use crate::core::CitrineError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// BOC macro-states. Only ever advances; `Finished` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BocState {
    Invalid,
    /// The backend request is done; beresp headers can be examined.
    ReqDone,
    /// Preparing for streaming.
    PrepStream,
    /// Body bytes are flowing; `len` grows.
    Stream,
    /// The object is complete.
    Finished,
    /// Something went wrong; deliverers must abort.
    Failed,
}

impl BocState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BocState::Finished | BocState::Failed)
    }
}

/// The published `(state, len)` pair.
#[derive(Debug, Clone, Copy)]
pub struct BocSnapshot {
    pub state: BocState,
    pub len: u64,
}

/// The busy-object context. Refcounted via `Arc`: the fetcher holds one
/// reference, each streaming deliverer one more.
#[derive(Debug)]
pub struct Boc {
    tx: watch::Sender<BocSnapshot>,
    /// The serialized vary description, set by the fetcher before unbusy so
    /// parked requests re-entering lookup can match against it.
    vary: Mutex<Option<Bytes>>,
    /// False when deliverers must wait for FINISHED (ESI parse pending, or
    /// streaming disabled by directive). Set by the fetcher before REQ_DONE.
    streamable: AtomicBool,
}

impl Default for Boc {
    fn default() -> Self {
        Self::new()
    }
}

impl Boc {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(BocSnapshot {
            state: BocState::Invalid,
            len: 0,
        });
        Self {
            tx,
            vary: Mutex::new(None),
            streamable: AtomicBool::new(true),
        }
    }

    pub fn streamable(&self) -> bool {
        self.streamable.load(Ordering::Acquire)
    }

    pub fn set_streamable(&self, v: bool) {
        self.streamable.store(v, Ordering::Release);
    }

    pub fn snapshot(&self) -> BocSnapshot {
        *self.tx.borrow()
    }

    pub fn state(&self) -> BocState {
        self.snapshot().state
    }

    pub fn len_so_far(&self) -> u64 {
        self.snapshot().len
    }

    pub fn vary(&self) -> Option<Bytes> {
        self.vary.lock().clone()
    }

    pub fn set_vary(&self, vary: Option<Bytes>) {
        *self.vary.lock() = vary;
    }

    /// Advances the macro-state, waking all waiters. Transitions backwards or
    /// out of a terminal state are ignored.
    pub fn set_state(&self, state: BocState) {
        self.tx.send_if_modified(|snap| {
            if snap.state.is_terminal() || state <= snap.state {
                return false;
            }
            snap.state = state;
            true
        });
    }

    /// Publishes `n` more committed body bytes and signals waiters.
    pub fn extend_len(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.tx.send_modify(|snap| {
            snap.len += n;
        });
    }

    /// Marks the fetch failed, waking all waiters. Terminal.
    pub fn fail(&self) {
        self.tx.send_if_modified(|snap| {
            if snap.state.is_terminal() {
                return false;
            }
            snap.state = BocState::Failed;
            true
        });
    }

    /// Waits until the state reaches at least `min`, or the deadline passes.
    pub async fn wait_state(
        &self,
        min: BocState,
        timeout: Duration,
    ) -> Result<BocSnapshot, CitrineError> {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snap = *rx.borrow_and_update();
            if snap.state >= min || snap.state.is_terminal() {
                return Ok(snap);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // The fetcher dropping the channel without a terminal state
                // counts as a failure.
                Ok(Err(_)) => return Err(CitrineError::FetchFailed("fetcher vanished".into())),
                Err(_) => return Err(CitrineError::Timeout),
            }
        }
    }

    /// Waits until `len > cursor` or a terminal state is reached.
    pub async fn wait_progress(
        &self,
        cursor: u64,
        timeout: Duration,
    ) -> Result<BocSnapshot, CitrineError> {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snap = *rx.borrow_and_update();
            if snap.len > cursor || snap.state.is_terminal() {
                return Ok(snap);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(CitrineError::FetchFailed("fetcher vanished".into())),
                Err(_) => return Err(CitrineError::Timeout),
            }
        }
    }
}
