// src/core/fetch/filters.rs

//! The fetch filter chain.
//!
//! Filters chain bottom-up from the protocol reader (length, chunked or
//! EOF-framed), through the optional gzip/gunzip/test-gunzip stages and the
//! ESI scanner, to the storage append loop in the fetch FSM pulling from the
//! top. Errors are sticky: a failed filter keeps returning an error and the
//! chain driver never pulls past the first failure.

use crate::core::CitrineError;
use crate::core::fetch::esi::EsiParser;
use crate::core::proto::http1::{ChunkStep, ChunkedDecoder};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

/// Raw bytes off the backend wire. `None` means clean EOF.
#[async_trait]
pub trait BodySource: Send {
    async fn recv(&mut self) -> Result<Option<Bytes>, CitrineError>;
}

/// A body source over a preloaded byte sequence; used by tests and by
/// synthetic bodies.
#[derive(Debug, Default)]
pub struct CannedSource {
    chunks: std::collections::VecDeque<Bytes>,
}

impl CannedSource {
    pub fn new(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }
}

#[async_trait]
impl BodySource for CannedSource {
    async fn recv(&mut self) -> Result<Option<Bytes>, CitrineError> {
        Ok(self.chunks.pop_front())
    }
}

/// One pull from a filter.
#[derive(Debug, PartialEq, Eq)]
pub enum FilterPull {
    Data(Bytes),
    End,
}

/// A pull-based fetch filter.
#[async_trait]
pub trait FetchFilter: Send {
    fn name(&self) -> &'static str;
    async fn pull(&mut self) -> Result<FilterPull, CitrineError>;
}

// --- Protocol readers -------------------------------------------------------

/// Content-Length framed body.
pub struct LengthReader {
    src: Box<dyn BodySource>,
    remaining: u64,
}

impl LengthReader {
    pub fn new(src: Box<dyn BodySource>, len: u64) -> Self {
        Self {
            src,
            remaining: len,
        }
    }
}

#[async_trait]
impl FetchFilter for LengthReader {
    fn name(&self) -> &'static str {
        "length"
    }

    async fn pull(&mut self) -> Result<FilterPull, CitrineError> {
        if self.remaining == 0 {
            return Ok(FilterPull::End);
        }
        match self.src.recv().await? {
            None => Err(CitrineError::BodyError(format!(
                "short body: {} bytes missing",
                self.remaining
            ))),
            Some(mut data) => {
                if (data.len() as u64) > self.remaining {
                    data.truncate(self.remaining as usize);
                }
                self.remaining -= data.len() as u64;
                Ok(FilterPull::Data(data))
            }
        }
    }
}

/// Transfer-Encoding: chunked framed body.
pub struct ChunkedReader {
    src: Box<dyn BodySource>,
    dec: ChunkedDecoder,
    buf: BytesMut,
}

impl ChunkedReader {
    pub fn new(src: Box<dyn BodySource>) -> Self {
        Self {
            src,
            dec: ChunkedDecoder::new(),
            buf: BytesMut::new(),
        }
    }
}

#[async_trait]
impl FetchFilter for ChunkedReader {
    fn name(&self) -> &'static str {
        "chunked"
    }

    async fn pull(&mut self) -> Result<FilterPull, CitrineError> {
        loop {
            match self.dec.step(&mut self.buf)? {
                ChunkStep::Data(data) => return Ok(FilterPull::Data(data)),
                ChunkStep::End => return Ok(FilterPull::End),
                ChunkStep::Incomplete => match self.src.recv().await? {
                    Some(data) => self.buf.extend_from_slice(&data),
                    None => {
                        return Err(CitrineError::BodyError(
                            "EOF inside chunked framing".into(),
                        ));
                    }
                },
            }
        }
    }
}

/// Close-delimited body.
pub struct EofReader {
    src: Box<dyn BodySource>,
}

impl EofReader {
    pub fn new(src: Box<dyn BodySource>) -> Self {
        Self { src }
    }
}

#[async_trait]
impl FetchFilter for EofReader {
    fn name(&self) -> &'static str {
        "eof"
    }

    async fn pull(&mut self) -> Result<FilterPull, CitrineError> {
        match self.src.recv().await? {
            Some(data) => Ok(FilterPull::Data(data)),
            None => Ok(FilterPull::End),
        }
    }
}

// --- Content transforms -----------------------------------------------------

/// Decompresses a gzipped body.
pub struct GunzipFilter {
    inner: Box<dyn FetchFilter>,
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl GunzipFilter {
    pub fn new(inner: Box<dyn FetchFilter>) -> Self {
        Self {
            inner,
            decoder: Some(GzDecoder::new(Vec::new())),
        }
    }
}

#[async_trait]
impl FetchFilter for GunzipFilter {
    fn name(&self) -> &'static str {
        "gunzip"
    }

    async fn pull(&mut self) -> Result<FilterPull, CitrineError> {
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(FilterPull::End);
            };
            match self.inner.pull().await? {
                FilterPull::Data(data) => {
                    decoder
                        .write_all(&data)
                        .map_err(|e| CitrineError::FilterError(format!("gunzip: {e}")))?;
                    let out = std::mem::take(decoder.get_mut());
                    if !out.is_empty() {
                        return Ok(FilterPull::Data(Bytes::from(out)));
                    }
                }
                FilterPull::End => {
                    let decoder = self.decoder.take().unwrap();
                    let out = decoder
                        .finish()
                        .map_err(|e| CitrineError::FilterError(format!("gunzip: {e}")))?;
                    if out.is_empty() {
                        return Ok(FilterPull::End);
                    }
                    return Ok(FilterPull::Data(Bytes::from(out)));
                }
            }
        }
    }
}

/// Compresses a plain body.
pub struct GzipFilter {
    inner: Box<dyn FetchFilter>,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipFilter {
    pub fn new(inner: Box<dyn FetchFilter>, level: u32) -> Self {
        Self {
            inner,
            encoder: Some(GzEncoder::new(Vec::new(), Compression::new(level))),
        }
    }
}

#[async_trait]
impl FetchFilter for GzipFilter {
    fn name(&self) -> &'static str {
        "gzip"
    }

    async fn pull(&mut self) -> Result<FilterPull, CitrineError> {
        loop {
            let Some(encoder) = self.encoder.as_mut() else {
                return Ok(FilterPull::End);
            };
            match self.inner.pull().await? {
                FilterPull::Data(data) => {
                    encoder
                        .write_all(&data)
                        .map_err(|e| CitrineError::FilterError(format!("gzip: {e}")))?;
                    let out = std::mem::take(encoder.get_mut());
                    if !out.is_empty() {
                        return Ok(FilterPull::Data(Bytes::from(out)));
                    }
                }
                FilterPull::End => {
                    let encoder = self.encoder.take().unwrap();
                    let out = encoder
                        .finish()
                        .map_err(|e| CitrineError::FilterError(format!("gzip: {e}")))?;
                    if out.is_empty() {
                        return Ok(FilterPull::End);
                    }
                    return Ok(FilterPull::Data(Bytes::from(out)));
                }
            }
        }
    }
}

/// Verifies a body claimed to be gzip actually is, passing the compressed
/// bytes through unchanged.
pub struct TestGunzipFilter {
    inner: Box<dyn FetchFilter>,
    decoder: Option<GzDecoder<DiscardWriter>>,
}

/// Swallows decompressed bytes; only the decoder's verdict matters.
#[derive(Debug, Default)]
struct DiscardWriter;

impl Write for DiscardWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl TestGunzipFilter {
    pub fn new(inner: Box<dyn FetchFilter>) -> Self {
        Self {
            inner,
            decoder: Some(GzDecoder::new(DiscardWriter)),
        }
    }
}

#[async_trait]
impl FetchFilter for TestGunzipFilter {
    fn name(&self) -> &'static str {
        "testgunzip"
    }

    async fn pull(&mut self) -> Result<FilterPull, CitrineError> {
        match self.inner.pull().await? {
            FilterPull::Data(data) => {
                if let Some(decoder) = self.decoder.as_mut() {
                    decoder.write_all(&data).map_err(|e| {
                        CitrineError::FilterError(format!("testgunzip: bad gzip stream: {e}"))
                    })?;
                }
                Ok(FilterPull::Data(data))
            }
            FilterPull::End => {
                if let Some(decoder) = self.decoder.take() {
                    decoder.finish().map_err(|e| {
                        CitrineError::FilterError(format!("testgunzip: truncated gzip stream: {e}"))
                    })?;
                }
                Ok(FilterPull::End)
            }
        }
    }
}

/// Scans the body for ESI instructions while passing bytes through. The
/// parser is shared with the fetch FSM, which serializes the segment list
/// into the object's aux attribute at completion.
pub struct EsiScanFilter {
    inner: Box<dyn FetchFilter>,
    parser: Arc<Mutex<EsiParser>>,
}

impl EsiScanFilter {
    pub fn new(inner: Box<dyn FetchFilter>, parser: Arc<Mutex<EsiParser>>) -> Self {
        Self { inner, parser }
    }
}

#[async_trait]
impl FetchFilter for EsiScanFilter {
    fn name(&self) -> &'static str {
        "esi"
    }

    async fn pull(&mut self) -> Result<FilterPull, CitrineError> {
        match self.inner.pull().await? {
            FilterPull::Data(data) => {
                self.parser.lock().feed(&data);
                Ok(FilterPull::Data(data))
            }
            FilterPull::End => {
                self.parser.lock().finish();
                Ok(FilterPull::End)
            }
        }
    }
}

// --- Chain driver -----------------------------------------------------------

/// Drives the assembled chain, making errors sticky.
pub struct FilterChain {
    top: Box<dyn FetchFilter>,
    failed: bool,
    ended: bool,
}

impl FilterChain {
    pub fn new(top: Box<dyn FetchFilter>) -> Self {
        Self {
            top,
            failed: false,
            ended: false,
        }
    }

    /// Pulls the next block of object bytes. After an error every further
    /// call returns the same sticky failure.
    pub async fn pull(&mut self) -> Result<FilterPull, CitrineError> {
        if self.failed {
            return Err(CitrineError::FilterError("filter chain poisoned".into()));
        }
        if self.ended {
            return Ok(FilterPull::End);
        }
        match self.top.pull().await {
            Ok(FilterPull::End) => {
                self.ended = true;
                Ok(FilterPull::End)
            }
            Ok(pull) => Ok(pull),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }
}
