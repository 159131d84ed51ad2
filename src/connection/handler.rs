// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a
//! client connection: decode a request, feed the request FSM, stream the
//! response events back, decide keep-alive, repeat.

use super::session::{Session, StreamClose};
use crate::core::CitrineError;
use crate::core::http::HttpMsg;
use crate::core::metrics;
use crate::core::proto::http1::{Http1Codec, Http1In, ParsedReq, RespEvent, WireFraming};
use crate::core::req::deliver::DeliverySink;
use crate::core::req::{Req, ReqEnv, ReqOutcome, run_req};
use crate::core::state::ServerState;
use crate::core::vsl::{TxnSide, Vsl, VslTag};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::debug;

/// Request bodies buffered beyond this are refused.
const MAX_REQ_BODY: usize = 1024 * 1024;

/// Manages the full lifecycle of a client connection.
pub struct ConnectionHandler {
    /// `None` after the stream was handed off to a pipe.
    framed: Option<Framed<TcpStream, Http1Codec>>,
    sess: Arc<Session>,
    state: Arc<ServerState>,
}

impl ConnectionHandler {
    pub async fn new(socket: TcpStream, addr: SocketAddr, state: Arc<ServerState>) -> Self {
        let (req_size, max_hdr) = {
            let config = state.config.lock().await;
            (config.limits.http_req_size, config.limits.http_max_hdr)
        };
        let local = socket
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let id = state.next_sess_id.fetch_add(1, Ordering::Relaxed);
        let sess = Arc::new(Session::new(id, addr, local));
        Self {
            framed: Some(Framed::new(socket, Http1Codec::new(req_size, max_hdr))),
            sess,
            state,
        }
    }

    /// The main loop: one iteration per HTTP transaction.
    pub async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), CitrineError> {
        let mut sess_vsl = Vsl::new(self.sess.id, TxnSide::Session, self.state.vsl.clone());
        sess_vsl.logf(
            VslTag::SessOpen,
            format!("{} {}", self.sess.peer_addr, self.sess.local_addr),
        );

        while !self.sess.closing() && self.framed.is_some() {
            let env = self.state.req_env().await;
            let timeout_idle = {
                let config = self.state.config.lock().await;
                config.timeouts.timeout_idle
            };

            // Wait for the next request head, bounded by timeout_idle.
            let framed = self.framed.as_mut().expect("stream present in loop");
            let head = tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.sess.close(StreamClose::TrafficRefuse);
                    break;
                }
                head = tokio::time::timeout(timeout_idle, framed.next()) => head,
            };
            let parsed = match head {
                Err(_) => {
                    self.sess.close(StreamClose::RxCloseIdle);
                    break;
                }
                Ok(None) => {
                    self.sess.close(StreamClose::RemClose);
                    break;
                }
                Ok(Some(Err(e))) => {
                    self.reject(&e).await;
                    break;
                }
                Ok(Some(Ok(Http1In::Req(parsed)))) => parsed,
                Ok(Some(Ok(_))) => {
                    self.sess.close(StreamClose::RxJunk);
                    break;
                }
            };
            self.sess.touch_idle();
            self.state.stats.increment_total_requests();

            let body = match self.read_body(&parsed, env.timeout_req).await {
                Ok(body) => body,
                Err(e) => {
                    self.reject(&e).await;
                    break;
                }
            };

            let mut req = Req::new(self.sess.clone(), parsed.msg.clone(), body, &env);
            let wants_close = parsed.msg.wants_close();
            let outcome = {
                let send_timeout = {
                    let config = self.state.config.lock().await;
                    config.timeouts.send_timeout
                };
                let mut sink = FramedSink {
                    framed: self.framed.as_mut().expect("stream present in loop"),
                    send_timeout,
                };
                run_req(&env, &mut req, &mut sink).await
            };
            match outcome {
                Ok(ReqOutcome::Done) => {
                    if wants_close {
                        self.sess.close(StreamClose::ReqClose);
                    }
                }
                Ok(ReqOutcome::Pipe { bereq }) => {
                    self.pipe(&env, bereq).await;
                    break;
                }
                Err(e) => {
                    debug!(sess = self.sess.id, "transaction failed: {}", e);
                    if self.sess.close_reason().is_none() {
                        self.sess.close(StreamClose::TxError);
                    }
                    break;
                }
            }
        }

        let reason = self.sess.close_reason().unwrap_or(StreamClose::RemClose);
        sess_vsl.logf(VslTag::SessClose, reason.name().to_string());
        debug!(sess = self.sess.id, reason = %reason, "session closed");
        Ok(())
    }

    /// Collects the request body off the wire, bounded in size and time.
    async fn read_body(
        &mut self,
        parsed: &ParsedReq,
        deadline: Duration,
    ) -> Result<Option<Bytes>, CitrineError> {
        use crate::core::http::BodyFraming;
        match parsed.framing {
            BodyFraming::None => Ok(None),
            BodyFraming::Error => Err(CitrineError::Protocol("bad body framing".into())),
            BodyFraming::Eof => Err(CitrineError::Protocol(
                "EOF-framed request bodies are not accepted".into(),
            )),
            BodyFraming::Length(_) | BodyFraming::Chunked => {
                let framed = self.framed.as_mut().expect("stream present");
                let mut buf = BytesMut::new();
                let fut = async {
                    while let Some(item) = framed.next().await {
                        match item? {
                            Http1In::Body(data) => {
                                if buf.len() + data.len() > MAX_REQ_BODY {
                                    return Err(CitrineError::BodyError(
                                        "request body too large".into(),
                                    ));
                                }
                                buf.extend_from_slice(&data);
                            }
                            Http1In::BodyEnd => return Ok(()),
                            Http1In::Req(_) => {
                                return Err(CitrineError::Protocol(
                                    "request head inside body".into(),
                                ));
                            }
                        }
                    }
                    Err(CitrineError::IncompleteData)
                };
                tokio::time::timeout(deadline, fut)
                    .await
                    .map_err(|_| CitrineError::Timeout)??;
                Ok(Some(buf.freeze()))
            }
        }
    }

    /// Sends a minimal error response for protocol-level failures, then
    /// records the close reason.
    async fn reject(&mut self, e: &CitrineError) {
        let (status, reason, close) = match e {
            CitrineError::HeaderOverflow | CitrineError::TooManyHeaders => {
                (400, "Bad Request", StreamClose::RxOverflow)
            }
            CitrineError::BodyError(_) => (413, "Payload Too Large", StreamClose::RxBody),
            CitrineError::Timeout => (408, "Request Timeout", StreamClose::RxTimeout),
            CitrineError::IncompleteData => (400, "Bad Request", StreamClose::RxBody),
            _ => (400, "Bad Request", StreamClose::RxBad),
        };
        if let Some(framed) = self.framed.as_mut() {
            let mut resp = HttpMsg::new_response(b"HTTP/1.1", status, reason.as_bytes());
            resp.set("content-length", &b"0"[..]);
            resp.set("connection", &b"close"[..]);
            let _ = framed
                .send(RespEvent::Head {
                    msg: resp,
                    framing: WireFraming::Len(0),
                })
                .await;
        }
        self.sess.close(close);
    }

    /// Ties the client socket to a backend connection. Terminal: the stream
    /// is taken out of the handler.
    async fn pipe(&mut self, env: &ReqEnv, bereq: HttpMsg) {
        let Some(framed) = self.framed.take() else {
            return;
        };
        let backend = match env.fetch.director.resolve().await {
            Ok(b) => b,
            Err(_) => {
                self.sess.close(StreamClose::TxError);
                return;
            }
        };
        // Pipelined bytes the codec already buffered are discarded.
        let mut client = framed.into_parts().io;
        let reason = backend.pipe(&bereq, &mut client).await;
        self.sess.close(reason);
        metrics::REQUESTS_TOTAL.inc();
    }
}

/// The delivery sink over the client connection: response events become wire
/// bytes through the codec. Every transmit carries the send deadline.
struct FramedSink<'a> {
    framed: &'a mut Framed<TcpStream, Http1Codec>,
    send_timeout: Duration,
}

impl FramedSink<'_> {
    async fn transmit(&mut self, event: RespEvent, flush: bool) -> Result<(), CitrineError> {
        let deadline = self.send_timeout;
        let fut = async {
            if flush {
                self.framed.send(event).await
            } else {
                self.framed.feed(event).await
            }
        };
        tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| CitrineError::Timeout)?
    }
}

#[async_trait]
impl DeliverySink for FramedSink<'_> {
    async fn send_head(
        &mut self,
        resp: &HttpMsg,
        framing: WireFraming,
    ) -> Result<(), CitrineError> {
        self.transmit(
            RespEvent::Head {
                msg: resp.clone(),
                framing,
            },
            true,
        )
        .await
    }

    async fn send_body(&mut self, flush: bool, data: Bytes) -> Result<(), CitrineError> {
        self.transmit(RespEvent::Body(data), flush).await
    }

    async fn finish(&mut self) -> Result<(), CitrineError> {
        self.transmit(RespEvent::End, true).await
    }
}
