// src/connection/session.rs

//! Defines the state associated with a single client session and the closed
//! set of stream-close reasons.

use crate::core::vcl::privs::TaskPrivs;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::Instant;

/// Why a stream (session or backend connection) was closed. The set is closed
/// and versioned; `idx` values are stable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClose {
    /// Peer closed.
    RemClose,
    /// Client requested close.
    ReqClose,
    /// Protocol below HTTP/1.1.
    ReqHttp10,
    /// Malformed request or response.
    RxBad,
    /// Failure receiving body.
    RxBody,
    /// Garbage bytes received.
    RxJunk,
    /// Receive buffer or workspace overflow.
    RxOverflow,
    /// Read timeout.
    RxTimeout,
    /// timeout_idle reached.
    RxCloseIdle,
    /// Piped transaction.
    TxPipe,
    /// Transmit error.
    TxError,
    /// EOF transmission.
    TxEof,
    /// Backend or directive requested close.
    RespClose,
    /// Out of some resource.
    Overload,
    /// Session pipe overflow.
    PipeOverflow,
    /// Insufficient data for range.
    RangeShort,
    /// HTTP/2 not accepted.
    ReqHttp20,
    /// Directive failure.
    VclFailure,
    /// Not accepting new traffic.
    TrafficRefuse,
}

impl StreamClose {
    /// The stable identifier of this reason.
    pub fn idx(self) -> u8 {
        match self {
            StreamClose::RemClose => 1,
            StreamClose::ReqClose => 2,
            StreamClose::ReqHttp10 => 3,
            StreamClose::RxBad => 4,
            StreamClose::RxBody => 5,
            StreamClose::RxJunk => 6,
            StreamClose::RxOverflow => 7,
            StreamClose::RxTimeout => 8,
            StreamClose::RxCloseIdle => 9,
            StreamClose::TxPipe => 10,
            StreamClose::TxError => 11,
            StreamClose::TxEof => 12,
            StreamClose::RespClose => 13,
            StreamClose::Overload => 14,
            StreamClose::PipeOverflow => 15,
            StreamClose::RangeShort => 16,
            StreamClose::ReqHttp20 => 17,
            StreamClose::VclFailure => 18,
            StreamClose::TrafficRefuse => 19,
        }
    }

    /// Whether this reason denotes an error.
    pub fn is_err(self) -> bool {
        matches!(
            self,
            StreamClose::ReqHttp10
                | StreamClose::RxBad
                | StreamClose::RxBody
                | StreamClose::RxJunk
                | StreamClose::RxOverflow
                | StreamClose::RxTimeout
                | StreamClose::TxError
                | StreamClose::Overload
                | StreamClose::PipeOverflow
                | StreamClose::RangeShort
                | StreamClose::ReqHttp20
                | StreamClose::VclFailure
        )
    }

    /// The short stat-style name.
    pub fn name(self) -> &'static str {
        match self {
            StreamClose::RemClose => "rem_close",
            StreamClose::ReqClose => "req_close",
            StreamClose::ReqHttp10 => "req_http10",
            StreamClose::RxBad => "rx_bad",
            StreamClose::RxBody => "rx_body",
            StreamClose::RxJunk => "rx_junk",
            StreamClose::RxOverflow => "rx_overflow",
            StreamClose::RxTimeout => "rx_timeout",
            StreamClose::RxCloseIdle => "rx_close_idle",
            StreamClose::TxPipe => "tx_pipe",
            StreamClose::TxError => "tx_error",
            StreamClose::TxEof => "tx_eof",
            StreamClose::RespClose => "resp_close",
            StreamClose::Overload => "overload",
            StreamClose::PipeOverflow => "pipe_overflow",
            StreamClose::RangeShort => "range_short",
            StreamClose::ReqHttp20 => "req_http20",
            StreamClose::VclFailure => "vcl_failure",
            StreamClose::TrafficRefuse => "traffic_refuse",
        }
    }

    /// The human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            StreamClose::RemClose => "Client Closed",
            StreamClose::ReqClose => "Client requested close",
            StreamClose::ReqHttp10 => "Proto < HTTP/1.1",
            StreamClose::RxBad => "Received bad req/resp",
            StreamClose::RxBody => "Failure receiving body",
            StreamClose::RxJunk => "Received junk data",
            StreamClose::RxOverflow => "Received buffer overflow",
            StreamClose::RxTimeout => "Receive timeout",
            StreamClose::RxCloseIdle => "timeout_idle reached",
            StreamClose::TxPipe => "Piped transaction",
            StreamClose::TxError => "Error transaction",
            StreamClose::TxEof => "EOF transmission",
            StreamClose::RespClose => "Backend/directive requested close",
            StreamClose::Overload => "Out of some resource",
            StreamClose::PipeOverflow => "Session pipe overflow",
            StreamClose::RangeShort => "Insufficient data for range",
            StreamClose::ReqHttp20 => "HTTP2 not accepted",
            StreamClose::VclFailure => "Directive failure",
            StreamClose::TrafficRefuse => "Not accepting new traffic",
        }
    }
}

impl std::fmt::Display for StreamClose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Holds the state specific to a single client session. One session may carry
/// several requests back to back; the close reason is set once and wins over
/// later, softer reasons.
#[derive(Debug)]
pub struct Session {
    /// Unique session id, also the session's log transaction id.
    pub id: u64,
    /// The client's remote address.
    pub peer_addr: SocketAddr,
    /// The listen endpoint the session arrived on.
    pub local_addr: SocketAddr,
    /// When the session was accepted.
    pub opened_at: Instant,
    /// Last time a complete request was read, for timeout_idle accounting.
    pub idle_since: Mutex<Instant>,
    /// The close reason, sticky once set.
    close_reason: Mutex<Option<StreamClose>>,
    /// Private storage shared across ESI-nested requests of this session.
    pub top_privs: Mutex<TaskPrivs>,
}

impl Session {
    pub fn new(id: u64, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer_addr,
            local_addr,
            opened_at: now,
            idle_since: Mutex::new(now),
            close_reason: Mutex::new(None),
            top_privs: Mutex::new(TaskPrivs::new()),
        }
    }

    /// Records a close reason. The first reason sticks; an error reason may
    /// upgrade a non-error one.
    pub fn close(&self, reason: StreamClose) {
        let mut guard = self.close_reason.lock();
        match *guard {
            None => *guard = Some(reason),
            Some(existing) if !existing.is_err() && reason.is_err() => *guard = Some(reason),
            Some(_) => {}
        }
    }

    /// The recorded close reason, if any.
    pub fn close_reason(&self) -> Option<StreamClose> {
        *self.close_reason.lock()
    }

    /// Whether a close has been requested.
    pub fn closing(&self) -> bool {
        self.close_reason.lock().is_some()
    }

    /// Stamps the session as idle as of now.
    pub fn touch_idle(&self) {
        *self.idle_since.lock() = Instant::now();
    }
}
