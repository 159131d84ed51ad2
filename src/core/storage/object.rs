// src/core/storage/object.rs

//! The stevedore-owned stored object: body segments plus a small attribute
//! set. Attributes round-trip byte-identically through the serializer so a
//! stevedore may persist and reload them.

use crate::core::CitrineError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// The fixed attribute kinds readable from an object core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjAttr {
    Status,
    Reason,
    Proto,
    Headers,
    Vary,
    Flags,
    Len,
    Xid,
    /// Aux attribute holding the serialized ESI segment list, when present.
    Esi,
}

/// The serializable attribute block of a stored object.
///
/// Byte layouts are private to this serializer; the only contract is an exact
/// round-trip.
#[derive(Debug, Clone, Default, PartialEq, bincode::Encode, bincode::Decode)]
pub struct ObjAttrs {
    pub status: u16,
    pub reason: Vec<u8>,
    pub proto: Vec<u8>,
    /// The variable-length response header blob (`http::encode_headers`).
    pub headers: Vec<u8>,
    /// The serialized vary description, when the response varies.
    pub vary: Option<Vec<u8>>,
    pub flags: u16,
    pub len: u64,
    pub xid: u64,
    /// Serialized ESI segment list, when the body was ESI-parsed.
    pub esi: Option<Vec<u8>>,
    /// Gzip state of the stored body.
    pub gzipped: bool,
    pub etag: Option<Vec<u8>>,
    pub last_modified: Option<Vec<u8>>,
}

impl ObjAttrs {
    /// Serializes the attribute block for the stevedore.
    pub fn encode(&self) -> Result<Vec<u8>, CitrineError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CitrineError::Internal(format!("attr encode: {e}")))
    }

    /// Reloads an attribute block written by [`ObjAttrs::encode`].
    pub fn decode(blob: &[u8]) -> Result<Self, CitrineError> {
        bincode::decode_from_slice(blob, bincode::config::standard())
            .map(|(attrs, _)| attrs)
            .map_err(|e| CitrineError::Internal(format!("attr decode: {e}")))
    }
}

/// A stored object: a list of body segments appended by the fetch pipeline
/// and the attribute block. Segments are immutable once the owning BOC
/// reaches its terminal state.
#[derive(Debug, Default)]
pub struct StoredObject {
    segments: Mutex<Vec<Bytes>>,
    attrs: Mutex<ObjAttrs>,
    len: AtomicU64,
}

impl StoredObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one body segment, returning the new total length.
    pub fn append(&self, data: Bytes) -> u64 {
        let n = data.len() as u64;
        self.segments.lock().push(data);
        self.len.fetch_add(n, Ordering::Release) + n
    }

    /// Total body bytes stored so far.
    pub fn get_len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Copies the segment list for iteration. Segment payloads are shared,
    /// not copied.
    pub fn segments(&self) -> Vec<Bytes> {
        self.segments.lock().clone()
    }

    /// Returns the body as one contiguous buffer. For bounded uses
    /// (conditional refresh, ESI expansion); delivery iterates segments.
    pub fn body_bytes(&self) -> Bytes {
        let segs = self.segments.lock();
        if segs.len() == 1 {
            return segs[0].clone();
        }
        let mut out = Vec::with_capacity(self.get_len() as usize);
        for s in segs.iter() {
            out.extend_from_slice(s);
        }
        Bytes::from(out)
    }

    /// Replaces the body wholesale. Used by conditional refresh to share the
    /// stale object's segments.
    pub fn adopt_body(&self, segments: Vec<Bytes>) {
        let total: u64 = segments.iter().map(|s| s.len() as u64).sum();
        *self.segments.lock() = segments;
        self.len.store(total, Ordering::Release);
    }

    pub fn attrs(&self) -> ObjAttrs {
        self.attrs.lock().clone()
    }

    pub fn set_attrs(&self, attrs: ObjAttrs) {
        *self.attrs.lock() = attrs;
    }

    pub fn with_attrs<R>(&self, f: impl FnOnce(&mut ObjAttrs) -> R) -> R {
        f(&mut self.attrs.lock())
    }

    pub fn has_attr(&self, kind: ObjAttr) -> bool {
        let attrs = self.attrs.lock();
        match kind {
            ObjAttr::Status | ObjAttr::Proto | ObjAttr::Flags | ObjAttr::Len | ObjAttr::Xid => true,
            ObjAttr::Reason => !attrs.reason.is_empty(),
            ObjAttr::Headers => !attrs.headers.is_empty(),
            ObjAttr::Vary => attrs.vary.is_some(),
            ObjAttr::Esi => attrs.esi.is_some(),
        }
    }

    /// Reads one attribute as raw bytes, `None` when absent.
    pub fn get_attr(&self, kind: ObjAttr) -> Option<Bytes> {
        let attrs = self.attrs.lock();
        match kind {
            ObjAttr::Status => Some(Bytes::from(attrs.status.to_le_bytes().to_vec())),
            ObjAttr::Reason => Some(Bytes::from(attrs.reason.clone())),
            ObjAttr::Proto => Some(Bytes::from(attrs.proto.clone())),
            ObjAttr::Headers => Some(Bytes::from(attrs.headers.clone())),
            ObjAttr::Vary => attrs.vary.clone().map(Bytes::from),
            ObjAttr::Flags => Some(Bytes::from(attrs.flags.to_le_bytes().to_vec())),
            ObjAttr::Len => Some(Bytes::from(attrs.len.to_le_bytes().to_vec())),
            ObjAttr::Xid => Some(Bytes::from(attrs.xid.to_le_bytes().to_vec())),
            ObjAttr::Esi => attrs.esi.clone().map(Bytes::from),
        }
    }
}
