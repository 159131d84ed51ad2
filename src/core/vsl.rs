// src/core/vsl.rs

//! The transaction log plane.
//!
//! Every task buffers `(vxid, tag, side, payload)` records locally and flushes
//! them on task boundaries into an mpsc channel drained by the log mailman
//! task. Records from one task are never reordered; the consumer sees each
//! task's records as one contiguous run per flush.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use strum_macros::Display;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Transaction id. Client and backend transactions draw from one sequence.
pub type Vxid = u64;

static NEXT_VXID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next transaction id.
pub fn next_vxid() -> Vxid {
    NEXT_VXID.fetch_add(1, Ordering::Relaxed)
}

/// Which side of the proxy a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TxnSide {
    Client,
    Backend,
    Session,
}

/// The closed, versioned set of record tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum VslTag {
    Begin,
    End,
    Link,
    ReqStart,
    ReqMethod,
    ReqUrl,
    ReqProtocol,
    ReqHeader,
    ReqUnset,
    ReqAcct,
    RespProtocol,
    RespStatus,
    RespReason,
    RespHeader,
    BereqMethod,
    BereqUrl,
    BereqHeader,
    BerespProtocol,
    BerespStatus,
    BerespReason,
    BerespHeader,
    ObjHeader,
    Timestamp,
    VclCall,
    VclReturn,
    VclUse,
    Hash,
    Hit,
    HitMiss,
    HitPass,
    Miss,
    Pass,
    Pipe,
    VaryMatch,
    BackendOpen,
    BackendClose,
    FetchError,
    FetchBody,
    Gzip,
    EsiIncl,
    TtlSet,
    BanAdd,
    BanKill,
    ExpKill,
    SessOpen,
    SessClose,
    WsOverflow,
    Error,
    Debug,
}

/// One append-only log record.
#[derive(Debug, Clone)]
pub struct VslRecord {
    pub vxid: Vxid,
    pub tag: VslTag,
    pub side: TxnSide,
    pub payload: Bytes,
}

/// Capacity of the channel into the mailman. Large enough that bursts of
/// task-boundary flushes do not stall request processing.
const VSL_CHANNEL_CAPACITY: usize = 4096;

/// The shared sending half of the log plane, cloned into every task.
#[derive(Debug, Clone)]
pub struct VslSink {
    tx: mpsc::Sender<Vec<VslRecord>>,
}

impl VslSink {
    /// Creates the sink and the receiver for the mailman task.
    pub fn new() -> (Self, mpsc::Receiver<Vec<VslRecord>>) {
        let (tx, rx) = mpsc::channel(VSL_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    fn submit(&self, batch: Vec<VslRecord>) {
        if batch.is_empty() {
            return;
        }
        // Dropping log records under extreme pressure is preferable to
        // stalling the data path.
        if self.tx.try_send(batch).is_err() {
            warn!("log plane congested, dropping a record batch");
        }
    }
}

/// A per-task record buffer. Records accumulate in order and leave the task
/// only through `flush`, which the FSMs call on transaction boundaries.
#[derive(Debug)]
pub struct Vsl {
    vxid: Vxid,
    side: TxnSide,
    buf: Vec<VslRecord>,
    sink: VslSink,
}

impl Vsl {
    pub fn new(vxid: Vxid, side: TxnSide, sink: VslSink) -> Self {
        Self {
            vxid,
            side,
            buf: Vec::with_capacity(32),
            sink,
        }
    }

    pub fn vxid(&self) -> Vxid {
        self.vxid
    }

    /// Appends one record to the task buffer.
    pub fn log(&mut self, tag: VslTag, payload: impl Into<Bytes>) {
        self.buf.push(VslRecord {
            vxid: self.vxid,
            tag,
            side: self.side,
            payload: payload.into(),
        });
    }

    /// Convenience for string payloads built in place.
    pub fn logf(&mut self, tag: VslTag, payload: String) {
        self.log(tag, Bytes::from(payload));
    }

    /// Pushes the buffered records to the mailman, preserving order.
    pub fn flush(&mut self) {
        self.sink.submit(std::mem::take(&mut self.buf));
    }
}

impl Drop for Vsl {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Drains record batches from all tasks. The actual consumer (shared-memory
/// segment, disk, an external log reader) is outside the core; here every
/// record is surfaced through `tracing` at trace level and counted.
pub async fn run_mailman(
    mut rx: mpsc::Receiver<Vec<VslRecord>>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    tracing::info!("Log mailman task started.");
    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(batch) = batch else { return };
                for rec in &batch {
                    trace!(
                        vxid = rec.vxid,
                        side = %rec.side,
                        tag = %rec.tag,
                        payload = %String::from_utf8_lossy(&rec.payload),
                        "vsl"
                    );
                }
                crate::core::metrics::VSL_RECORDS_TOTAL.inc_by(batch.len() as f64);
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Log mailman task shutting down.");
                return;
            }
        }
    }
}
