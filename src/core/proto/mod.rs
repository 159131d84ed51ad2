// src/core/proto/mod.rs

//! The narrow protocol-layer boundary.
//!
//! This module turns wire bytes into parsed requests and delivery events into
//! wire bytes. Nothing above it ever touches raw HTTP/1 framing; nothing in
//! it knows about caching.

pub mod http1;

pub use http1::{ChunkedDecoder, Http1Codec, Http1In, ParsedReq, RespEvent, WireFraming};
