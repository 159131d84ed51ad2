// src/core/http.rs

//! The in-core representation of HTTP messages.
//!
//! The wire parsers live in `core::proto`; everything above them works on
//! `HttpMsg`: an ordered header list plus the fixed request/response line
//! fields. Header names compare case-insensitively, values keep their bytes.

use crate::core::CitrineError;
use bytes::Bytes;

/// How a message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    None,
    /// Content-Length delimited.
    Length(u64),
    /// Transfer-Encoding: chunked.
    Chunked,
    /// Delimited by connection close.
    Eof,
    /// Framing headers were contradictory or unparseable.
    Error,
}

/// An ordered HTTP header set with the request/response line fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpMsg {
    /// Request method, empty on responses.
    pub method: Bytes,
    /// Request URL, empty on responses.
    pub url: Bytes,
    /// Protocol, e.g. `HTTP/1.1`.
    pub proto: Bytes,
    /// Response status, 0 on requests.
    pub status: u16,
    /// Response reason phrase.
    pub reason: Bytes,
    /// Ordered `(name, value)` pairs.
    pub headers: Vec<(Bytes, Bytes)>,
}

impl HttpMsg {
    pub fn new_request(method: &[u8], url: &[u8], proto: &[u8]) -> Self {
        Self {
            method: Bytes::copy_from_slice(method),
            url: Bytes::copy_from_slice(url),
            proto: Bytes::copy_from_slice(proto),
            ..Default::default()
        }
    }

    pub fn new_response(proto: &[u8], status: u16, reason: &[u8]) -> Self {
        Self {
            proto: Bytes::copy_from_slice(proto),
            status,
            reason: Bytes::copy_from_slice(reason),
            ..Default::default()
        }
    }

    /// Returns the first header with the given name, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v)
    }

    /// Returns the first header value as a &str, if present and valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a header, keeping insertion order.
    pub fn set(&mut self, name: &str, value: impl Into<Bytes>) {
        self.headers
            .push((Bytes::copy_from_slice(name.as_bytes()), value.into()));
    }

    /// Replaces all occurrences of a header with a single value.
    pub fn replace(&mut self, name: &str, value: impl Into<Bytes>) {
        self.unset(name);
        self.set(name, value);
    }

    /// Removes all headers with the given name.
    pub fn unset(&mut self, name: &str) {
        self.headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name.as_bytes()));
    }

    /// Derives the body framing descriptor from the message headers.
    ///
    /// Transfer-Encoding wins over Content-Length; a message carrying both is
    /// framed as chunked per RFC 7230 §3.3.3, a malformed Content-Length is a
    /// framing error.
    pub fn body_framing(&self, is_response: bool) -> BodyFraming {
        if let Some(te) = self.get_str("transfer-encoding") {
            if te.eq_ignore_ascii_case("chunked") {
                return BodyFraming::Chunked;
            }
            return BodyFraming::Error;
        }
        if let Some(cl) = self.get_str("content-length") {
            return match cl.trim().parse::<u64>() {
                Ok(0) => BodyFraming::None,
                Ok(n) => BodyFraming::Length(n),
                Err(_) => BodyFraming::Error,
            };
        }
        if is_response {
            // Response bodies without explicit framing run to EOF, except
            // where the status forbids a body.
            match self.status {
                204 | 304 => BodyFraming::None,
                s if (100..200).contains(&s) => BodyFraming::None,
                _ => BodyFraming::Eof,
            }
        } else {
            BodyFraming::None
        }
    }

    /// True when the message (or the peer) asked for connection close.
    pub fn wants_close(&self) -> bool {
        self.get_str("connection")
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
    }
}

/// The serialized form of the variable-length header attribute, used by the
/// stevedore. Round-trips byte-identically.
pub fn encode_headers(headers: &[(Bytes, Bytes)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (n, v) in headers {
        out.extend_from_slice(&(n.len() as u32).to_le_bytes());
        out.extend_from_slice(n);
        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
        out.extend_from_slice(v);
    }
    out
}

/// Decodes a header blob produced by [`encode_headers`].
pub fn decode_headers(mut blob: &[u8]) -> Result<Vec<(Bytes, Bytes)>, CitrineError> {
    fn take_field(blob: &mut &[u8]) -> Result<Bytes, CitrineError> {
        if blob.len() < 4 {
            return Err(CitrineError::Protocol("truncated header blob".into()));
        }
        let len = u32::from_le_bytes(blob[..4].try_into().unwrap()) as usize;
        if blob.len() < 4 + len {
            return Err(CitrineError::Protocol("truncated header blob".into()));
        }
        let field = Bytes::copy_from_slice(&blob[4..4 + len]);
        *blob = &blob[4 + len..];
        Ok(field)
    }

    let mut headers = Vec::new();
    while !blob.is_empty() {
        let n = take_field(&mut blob)?;
        let v = take_field(&mut blob)?;
        headers.push((n, v));
    }
    Ok(headers)
}
