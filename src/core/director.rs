// src/core/director.rs

//! Directors and backends: the capability layer that resolves a logical
//! backend into a concrete connection and runs one backend transaction over
//! it.
//!
//! A backend connection walks NULL → HDRS (after gethdrs) → BODY (after the
//! body reader is attached) → NULL (after finish). Connections are one-shot:
//! each fetch opens, uses and closes its own.

use crate::connection::session::StreamClose;
use crate::core::CitrineError;
use crate::core::fetch::filters::BodySource;
use crate::core::http::{BodyFraming, HttpMsg};
use crate::core::proto::http1;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tracing::debug;

/// Lifecycle events delivered to directors and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectorEvent {
    Start,
    Healthy,
    Sick,
    Stop,
}

/// Diagnostic connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Null,
    Hdrs,
    Body,
}

/// Deadlines for one backend transaction.
#[derive(Debug, Clone, Copy)]
pub struct BackendTimeouts {
    pub connect: Duration,
    pub first_byte: Duration,
    pub between_bytes: Duration,
}

/// One backend transaction: the parsed response head and its body source.
pub struct BackendTxn {
    pub beresp: HttpMsg,
    pub framing: BodyFraming,
    pub body: Box<dyn BodySource>,
}

impl std::fmt::Debug for BackendTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTxn")
            .field("status", &self.beresp.status)
            .field("framing", &self.framing)
            .finish()
    }
}

/// A concrete backend.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn getip(&self) -> Option<IpAddr>;

    /// Sends the backend request and reads the response head.
    async fn gethdrs(
        &self,
        bereq: &HttpMsg,
        body: Option<Bytes>,
        timeouts: &BackendTimeouts,
    ) -> Result<BackendTxn, CitrineError>;

    /// Ties the client stream to a fresh backend connection after sending
    /// the backend request verbatim. Terminal for the session.
    async fn pipe(&self, bereq: &HttpMsg, client: &mut TcpStream) -> StreamClose;

    /// Returns the transaction's connection resources.
    fn finish(&self);
}

/// A director resolves a logical backend for one fetch.
#[async_trait]
pub trait Director: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn resolve(&self) -> Result<Arc<dyn Backend>, CitrineError>;

    /// Health as last probed; `changed` receives the time of the last flip.
    fn healthy(&self, changed: &mut Option<SystemTime>) -> bool;

    /// Renders the admin listing, plain or JSON.
    fn list(&self, json: bool, verbose: bool) -> String;

    fn event(&self, ev: DirectorEvent);
}

// --- The TCP backend --------------------------------------------------------

/// A plain HTTP/1 backend over TCP.
#[derive(Debug)]
pub struct TcpBackend {
    name: String,
    addr: SocketAddr,
    healthy: AtomicBool,
    max_hdrs: usize,
}

impl TcpBackend {
    pub fn new(name: impl Into<String>, addr: SocketAddr, max_hdrs: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            addr,
            healthy: AtomicBool::new(true),
            max_hdrs,
        })
    }
}

#[async_trait]
impl Backend for TcpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn getip(&self) -> Option<IpAddr> {
        Some(self.addr.ip())
    }

    async fn gethdrs(
        &self,
        bereq: &HttpMsg,
        body: Option<Bytes>,
        timeouts: &BackendTimeouts,
    ) -> Result<BackendTxn, CitrineError> {
        let stream = tokio::time::timeout(timeouts.connect, TcpStream::connect(self.addr))
            .await
            .map_err(|_| CitrineError::FetchFailed(format!("connect timeout to {}", self.addr)))?
            .map_err(|e| CitrineError::FetchFailed(format!("connect to {}: {e}", self.addr)))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut head = BytesMut::new();
        http1::encode_req_head(bereq, &mut head);
        write_half.write_all(&head).await?;
        if let Some(body) = body {
            write_half.write_all(&body).await?;
        }
        write_half.flush().await?;
        debug!(backend = %self.name, "backend request sent");

        // Read until the response head is complete, first byte under its own
        // deadline.
        let mut conn = TcpBodySource {
            read: read_half,
            _write: write_half,
            buf: BytesMut::with_capacity(16 * 1024),
            between_bytes: timeouts.between_bytes,
        };
        let mut first = true;
        let (head_end, term) = loop {
            if let Some(found) = find_head_end(&conn.buf) {
                break found;
            }
            let deadline = if first {
                timeouts.first_byte
            } else {
                timeouts.between_bytes
            };
            let n = tokio::time::timeout(deadline, conn.fill())
                .await
                .map_err(|_| {
                    CitrineError::FetchFailed(if first {
                        "first byte timeout".into()
                    } else {
                        "timeout reading response head".into()
                    })
                })??;
            if n == 0 {
                return Err(CitrineError::FetchFailed(
                    "backend closed before response head".into(),
                ));
            }
            first = false;
        };
        let head = conn.buf.split_to(head_end + term);
        let beresp = http1::parse_resp_head(&head[..head_end], self.max_hdrs)?;
        let framing = beresp.body_framing(true);

        Ok(BackendTxn {
            beresp,
            framing,
            body: Box::new(conn),
        })
    }

    async fn pipe(&self, bereq: &HttpMsg, client: &mut TcpStream) -> StreamClose {
        let mut backend = match TcpStream::connect(self.addr).await {
            Ok(s) => s,
            Err(_) => return StreamClose::TxError,
        };
        let mut head = BytesMut::new();
        http1::encode_req_head(bereq, &mut head);
        if backend.write_all(&head).await.is_err() {
            return StreamClose::TxError;
        }
        match tokio::io::copy_bidirectional(client, &mut backend).await {
            Ok(_) => StreamClose::TxPipe,
            Err(_) => StreamClose::TxError,
        }
    }

    fn finish(&self) {
        // One-shot connections; dropping the body source closes them.
    }
}

/// Locates the CRLFCRLF (or LFLF) head terminator.
fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

/// The raw body source over the backend socket. Buffered head remainder
/// drains first.
struct TcpBodySource {
    read: OwnedReadHalf,
    /// Kept so the backend does not see a half-closed connection mid-body.
    _write: tokio::net::tcp::OwnedWriteHalf,
    buf: BytesMut,
    between_bytes: Duration,
}

impl TcpBodySource {
    async fn fill(&mut self) -> Result<usize, CitrineError> {
        let n = self.read.read_buf(&mut self.buf).await?;
        Ok(n)
    }
}

#[async_trait]
impl BodySource for TcpBodySource {
    async fn recv(&mut self) -> Result<Option<Bytes>, CitrineError> {
        if !self.buf.is_empty() {
            return Ok(Some(self.buf.split().freeze()));
        }
        let n = tokio::time::timeout(self.between_bytes, self.fill())
            .await
            .map_err(|_| CitrineError::BodyError("between-bytes timeout".into()))??;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}

// --- The static director ----------------------------------------------------

/// The simplest director: one configured backend.
#[derive(Debug)]
pub struct StaticDirector {
    name: String,
    backend: Arc<TcpBackend>,
    changed: parking_lot::Mutex<Option<SystemTime>>,
}

impl StaticDirector {
    pub fn new(name: impl Into<String>, backend: Arc<TcpBackend>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            backend,
            changed: parking_lot::Mutex::new(None),
        })
    }
}

#[async_trait]
impl Director for StaticDirector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self) -> Result<Arc<dyn Backend>, CitrineError> {
        if !self.backend.healthy.load(Ordering::Relaxed) {
            return Err(CitrineError::NoBackend);
        }
        Ok(self.backend.clone() as Arc<dyn Backend>)
    }

    fn healthy(&self, changed: &mut Option<SystemTime>) -> bool {
        *changed = *self.changed.lock();
        self.backend.healthy.load(Ordering::Relaxed)
    }

    fn list(&self, json: bool, verbose: bool) -> String {
        let healthy = self.backend.healthy.load(Ordering::Relaxed);
        if json {
            let mut obj = serde_json::json!({
                "name": self.name,
                "backend": self.backend.name(),
                "healthy": healthy,
            });
            if verbose && let Some(ip) = self.backend.getip() {
                obj["address"] = serde_json::Value::String(ip.to_string());
            }
            obj.to_string()
        } else if verbose {
            format!(
                "{} -> {} ({}) {}",
                self.name,
                self.backend.name(),
                self.backend
                    .getip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_default(),
                if healthy { "healthy" } else { "sick" },
            )
        } else {
            format!(
                "{} {}",
                self.name,
                if healthy { "healthy" } else { "sick" }
            )
        }
    }

    fn event(&self, ev: DirectorEvent) {
        match ev {
            DirectorEvent::Healthy => {
                self.backend.healthy.store(true, Ordering::Relaxed);
                *self.changed.lock() = Some(SystemTime::now());
            }
            DirectorEvent::Sick => {
                self.backend.healthy.store(false, Ordering::Relaxed);
                *self.changed.lock() = Some(SystemTime::now());
            }
            DirectorEvent::Start | DirectorEvent::Stop => {}
        }
    }
}
