// src/core/proto/http1.rs

//! Implements the HTTP/1 head parser and the response event encoder as a
//! `tokio_util::codec` pair, plus the standalone helpers the backend
//! connection uses for its side of the wire.

use crate::core::CitrineError;
use crate::core::http::{BodyFraming, HttpMsg};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

/// A parsed request head as handed to the request FSM.
#[derive(Debug, Clone)]
pub struct ParsedReq {
    pub msg: HttpMsg,
    pub framing: BodyFraming,
    /// Size of the head on the wire, for accounting.
    pub head_len: usize,
}

/// Items produced by the decoder: a request head, then its body bytes if the
/// framing carries any, then an end marker.
#[derive(Debug)]
pub enum Http1In {
    Req(ParsedReq),
    Body(Bytes),
    BodyEnd,
}

/// How the response body will be framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFraming {
    Len(u64),
    Chunked,
    Eof,
}

/// Events fed to the encoder by the delivery pipeline.
#[derive(Debug)]
pub enum RespEvent {
    Head { msg: HttpMsg, framing: WireFraming },
    Body(Bytes),
    End,
}

#[derive(Debug)]
enum DecodeState {
    Head,
    Body { remaining: u64 },
    ChunkedBody(ChunkedDecoder),
}

/// The client-side HTTP/1 codec. Decodes request heads and bodies, encodes
/// response events.
#[derive(Debug)]
pub struct Http1Codec {
    max_head: usize,
    max_hdrs: usize,
    state: DecodeState,
    /// Encoder-side framing of the response in flight.
    tx_framing: Option<WireFraming>,
}

impl Http1Codec {
    pub fn new(max_head: usize, max_hdrs: usize) -> Self {
        Self {
            max_head,
            max_hdrs,
            state: DecodeState::Head,
            tx_framing: None,
        }
    }
}

/// Finds the end of a message head, tolerating bare-LF line endings.
/// Returns (head_end, terminator_len).
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

fn split_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n').map(|line| {
        if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        }
    })
}

fn parse_header_line(line: &[u8]) -> Result<(Bytes, Bytes), CitrineError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| CitrineError::Protocol("header line without colon".into()))?;
    let name = &line[..colon];
    if name.is_empty() || name.iter().any(|&b| b == b' ' || b == b'\t') {
        return Err(CitrineError::Protocol("malformed header name".into()));
    }
    let mut value = &line[colon + 1..];
    while value.first().is_some_and(|&b| b == b' ' || b == b'\t') {
        value = &value[1..];
    }
    while value.last().is_some_and(|&b| b == b' ' || b == b'\t') {
        value = &value[..value.len() - 1];
    }
    Ok((Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)))
}

/// Parses a full request head. Used by the codec and by tests.
pub fn parse_req_head(head: &[u8], max_hdrs: usize) -> Result<HttpMsg, CitrineError> {
    let mut lines = split_lines(head);
    let req_line = lines
        .next()
        .ok_or_else(|| CitrineError::Protocol("empty request head".into()))?;
    let mut parts = req_line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method = parts
        .next()
        .ok_or_else(|| CitrineError::Protocol("missing method".into()))?;
    let url = parts
        .next()
        .ok_or_else(|| CitrineError::Protocol("missing url".into()))?;
    let proto = parts
        .next()
        .ok_or_else(|| CitrineError::Protocol("missing protocol".into()))?;
    if !proto.starts_with(b"HTTP/1.") {
        return Err(CitrineError::Protocol(format!(
            "unsupported protocol {}",
            String::from_utf8_lossy(proto)
        )));
    }
    let mut msg = HttpMsg::new_request(method, url, proto);
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if msg.headers.len() >= max_hdrs {
            return Err(CitrineError::TooManyHeaders);
        }
        let (n, v) = parse_header_line(line)?;
        msg.headers.push((n, v));
    }
    Ok(msg)
}

/// Parses a full response head from a backend.
pub fn parse_resp_head(head: &[u8], max_hdrs: usize) -> Result<HttpMsg, CitrineError> {
    let mut lines = split_lines(head);
    let status_line = lines
        .next()
        .ok_or_else(|| CitrineError::Protocol("empty response head".into()))?;
    let mut parts = status_line.splitn(3, |&b| b == b' ');
    let proto = parts
        .next()
        .filter(|p| p.starts_with(b"HTTP/1."))
        .ok_or_else(|| CitrineError::Protocol("bad response protocol".into()))?;
    let status: u16 = std::str::from_utf8(
        parts
            .next()
            .ok_or_else(|| CitrineError::Protocol("missing status".into()))?,
    )?
    .trim()
    .parse()?;
    if !(100..1000).contains(&status) {
        return Err(CitrineError::Protocol(format!("bad status {status}")));
    }
    let reason = parts.next().unwrap_or(b"");
    let mut msg = HttpMsg::new_response(proto, status, reason);
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if msg.headers.len() >= max_hdrs {
            return Err(CitrineError::TooManyHeaders);
        }
        let (n, v) = parse_header_line(line)?;
        msg.headers.push((n, v));
    }
    Ok(msg)
}

/// Serializes a request head for the backend side of the wire.
pub fn encode_req_head(msg: &HttpMsg, dst: &mut BytesMut) {
    dst.extend_from_slice(&msg.method);
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(&msg.url);
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(&msg.proto);
    dst.extend_from_slice(CRLF);
    for (n, v) in &msg.headers {
        dst.extend_from_slice(n);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(v);
        dst.extend_from_slice(CRLF);
    }
    dst.extend_from_slice(CRLF);
}

/// Serializes a response head for the client side of the wire.
pub fn encode_resp_head(msg: &HttpMsg, dst: &mut BytesMut) {
    dst.extend_from_slice(&msg.proto);
    dst.extend_from_slice(b" ");
    let mut itoa_buf = itoa::Buffer::new();
    dst.extend_from_slice(itoa_buf.format(msg.status).as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(&msg.reason);
    dst.extend_from_slice(CRLF);
    for (n, v) in &msg.headers {
        dst.extend_from_slice(n);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(v);
        dst.extend_from_slice(CRLF);
    }
    dst.extend_from_slice(CRLF);
}

/// Incremental Transfer-Encoding: chunked decoder, shared by the client codec
/// and the backend body reader.
#[derive(Debug, Default)]
pub struct ChunkedDecoder {
    /// Bytes left in the current chunk, when inside one.
    chunk_remaining: u64,
    finished: bool,
}

/// One step of chunked decoding.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkStep {
    /// Decoded payload bytes.
    Data(Bytes),
    /// Need more input.
    Incomplete,
    /// The terminating zero chunk was consumed.
    End,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Consumes as much of `buf` as possible, returning the next step.
    pub fn step(&mut self, buf: &mut BytesMut) -> Result<ChunkStep, CitrineError> {
        if self.finished {
            return Ok(ChunkStep::End);
        }
        if self.chunk_remaining > 0 {
            if buf.is_empty() {
                return Ok(ChunkStep::Incomplete);
            }
            let take = (self.chunk_remaining).min(buf.len() as u64) as usize;
            let data = buf.split_to(take).freeze();
            self.chunk_remaining -= take as u64;
            if self.chunk_remaining == 0 {
                // Consume the chunk-terminating CRLF if present; otherwise it
                // will be skipped on the next call.
                if buf.len() >= 2 && &buf[..2] == CRLF {
                    buf.advance(2);
                }
            }
            return Ok(ChunkStep::Data(data));
        }
        // Skip a dangling CRLF from the previous chunk.
        if buf.len() >= 2 && &buf[..2] == CRLF {
            buf.advance(2);
        }
        let Some(eol) = buf.iter().position(|&b| b == b'\n') else {
            return Ok(ChunkStep::Incomplete);
        };
        let line = buf.split_to(eol + 1);
        let line = &line[..eol];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        // Chunk extensions after ';' are ignored.
        let size_part = line.split(|&b| b == b';').next().unwrap_or(b"");
        let size_str = std::str::from_utf8(size_part)
            .map_err(|_| CitrineError::Protocol("bad chunk size".into()))?
            .trim();
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| CitrineError::Protocol(format!("bad chunk size '{size_str}'")))?;
        if size == 0 {
            self.finished = true;
            // Trailer section is not supported; a bare CRLF terminator is
            // consumed when available.
            if buf.len() >= 2 && &buf[..2] == CRLF {
                buf.advance(2);
            }
            return Ok(ChunkStep::End);
        }
        self.chunk_remaining = size;
        self.step(buf)
    }
}

impl Decoder for Http1Codec {
    type Item = Http1In;
    type Error = CitrineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Http1In>, CitrineError> {
        match &mut self.state {
            DecodeState::Head => {
                let Some((end, term)) = find_head_end(src) else {
                    if src.len() > self.max_head {
                        return Err(CitrineError::HeaderOverflow);
                    }
                    return Ok(None);
                };
                let head_len = end + term;
                if head_len > self.max_head {
                    return Err(CitrineError::HeaderOverflow);
                }
                let head = src.split_to(head_len);
                let msg = parse_req_head(&head[..end], self.max_hdrs)?;
                let framing = msg.body_framing(false);
                match framing {
                    BodyFraming::Length(n) => self.state = DecodeState::Body { remaining: n },
                    BodyFraming::Chunked => {
                        self.state = DecodeState::ChunkedBody(ChunkedDecoder::new())
                    }
                    _ => {}
                }
                Ok(Some(Http1In::Req(ParsedReq {
                    msg,
                    framing,
                    head_len,
                })))
            }
            DecodeState::Body { remaining } => {
                if *remaining == 0 {
                    self.state = DecodeState::Head;
                    return Ok(Some(Http1In::BodyEnd));
                }
                if src.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(src.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Some(Http1In::Body(src.split_to(take).freeze())))
            }
            DecodeState::ChunkedBody(dec) => match dec.step(src)? {
                ChunkStep::Data(data) => Ok(Some(Http1In::Body(data))),
                ChunkStep::Incomplete => Ok(None),
                ChunkStep::End => {
                    self.state = DecodeState::Head;
                    Ok(Some(Http1In::BodyEnd))
                }
            },
        }
    }
}

impl Encoder<RespEvent> for Http1Codec {
    type Error = CitrineError;

    fn encode(&mut self, item: RespEvent, dst: &mut BytesMut) -> Result<(), CitrineError> {
        match item {
            RespEvent::Head { msg, framing } => {
                encode_resp_head(&msg, dst);
                self.tx_framing = Some(framing);
            }
            RespEvent::Body(data) => {
                if data.is_empty() {
                    return Ok(());
                }
                match self.tx_framing {
                    Some(WireFraming::Chunked) => {
                        let mut len_buf = [0u8; 16];
                        let len_str = write_hex(data.len() as u64, &mut len_buf);
                        dst.extend_from_slice(len_str);
                        dst.extend_from_slice(CRLF);
                        dst.extend_from_slice(&data);
                        dst.extend_from_slice(CRLF);
                    }
                    Some(_) => dst.extend_from_slice(&data),
                    None => {
                        return Err(CitrineError::Internal(
                            "response body before head".into(),
                        ));
                    }
                }
            }
            RespEvent::End => {
                if matches!(self.tx_framing, Some(WireFraming::Chunked)) {
                    dst.extend_from_slice(b"0\r\n\r\n");
                }
                self.tx_framing = None;
            }
        }
        Ok(())
    }
}

/// Formats `n` as lowercase hex into `buf`, returning the written slice.
fn write_hex(mut n: u64, buf: &mut [u8; 16]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    if n == 0 {
        buf[0] = b'0';
        return &buf[..1];
    }
    let mut i = 16;
    while n > 0 {
        i -= 1;
        buf[i] = DIGITS[(n & 0xf) as usize];
        n >>= 4;
    }
    buf.copy_within(i.., 0);
    let len = 16 - i;
    &buf[..len]
}
