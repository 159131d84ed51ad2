// src/core/fetch/esi.rs

//! ESI instruction scanning and the segment model shared between the fetch
//! pipeline (which builds it) and delivery (which expands it).
//!
//! Only `<esi:include src="..."/>` is interpreted; everything else in the
//! body is literal. Segments reference byte ranges of the stored body, so
//! the body is stored verbatim and delivery skips the instruction bytes.

use crate::core::CitrineError;

const INCLUDE_TAG: &[u8] = b"<esi:include";
/// A tag split across chunk boundaries is reassembled up to this size;
/// anything longer is delivered as literal content.
const MAX_TAG_LEN: usize = 4096;

/// One delivery instruction.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum EsiSeg {
    /// Emit `len` stored body bytes starting at `off`.
    Literal { off: u64, len: u64 },
    /// Expand a child request for `src` in place.
    Include { src: String },
}

/// Serializes a segment list into the object's aux attribute.
pub fn encode_segments(segs: &[EsiSeg]) -> Result<Vec<u8>, CitrineError> {
    bincode::encode_to_vec(segs, bincode::config::standard())
        .map_err(|e| CitrineError::Internal(format!("esi encode: {e}")))
}

/// Reloads a segment list written by [`encode_segments`].
pub fn decode_segments(blob: &[u8]) -> Result<Vec<EsiSeg>, CitrineError> {
    bincode::decode_from_slice(blob, bincode::config::standard())
        .map(|(segs, _)| segs)
        .map_err(|e| CitrineError::Internal(format!("esi decode: {e}")))
}

/// Incremental scanner fed by the ESI fetch filter.
#[derive(Debug, Default)]
pub struct EsiParser {
    segs: Vec<EsiSeg>,
    /// Absolute offset of the first byte of `carry` in the stored body.
    carry_off: u64,
    /// Unconsumed tail that may hold the start of a split tag.
    carry: Vec<u8>,
    /// Absolute offset of the next unseen byte.
    pos: u64,
    includes: usize,
}

impl EsiParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any include instruction was found.
    pub fn has_includes(&self) -> bool {
        self.includes > 0
    }

    /// Feeds the next stored-body chunk.
    pub fn feed(&mut self, data: &[u8]) {
        let owned;
        let (base, buf): (u64, &[u8]) = if self.carry.is_empty() {
            (self.pos, data)
        } else {
            let mut work = std::mem::take(&mut self.carry);
            work.extend_from_slice(data);
            owned = work;
            (self.carry_off, &owned)
        };
        self.pos += data.len() as u64;

        let mut cursor = 0usize;
        while cursor < buf.len() {
            let Some(tag_rel) = find(&buf[cursor..], INCLUDE_TAG) else {
                // Keep a tail that could be a split tag prefix.
                let keep = split_candidate_len(&buf[cursor..]);
                let literal_len = buf.len() - cursor - keep;
                self.push_literal(base + cursor as u64, literal_len as u64);
                let carry_start = cursor + literal_len;
                self.carry = buf[carry_start..].to_vec();
                self.carry_off = base + carry_start as u64;
                return;
            };
            let tag_start = cursor + tag_rel;
            match find(&buf[tag_start..], b"/>") {
                Some(end_rel) => {
                    let tag_end = tag_start + end_rel + 2;
                    self.push_literal(base + cursor as u64, (tag_start - cursor) as u64);
                    let tag = &buf[tag_start..tag_end];
                    if let Some(src) = extract_src(tag) {
                        self.includes += 1;
                        self.segs.push(EsiSeg::Include { src });
                    } else {
                        // Malformed include: deliver it as written.
                        self.push_literal(base + tag_start as u64, (tag_end - tag_start) as u64);
                    }
                    cursor = tag_end;
                }
                None => {
                    if buf.len() - tag_start > MAX_TAG_LEN {
                        // Unterminated tag, give up on it.
                        self.push_literal(base + cursor as u64, (buf.len() - cursor) as u64);
                        self.carry.clear();
                        return;
                    }
                    // Tag may complete in the next chunk.
                    self.push_literal(base + cursor as u64, (tag_start - cursor) as u64);
                    self.carry = buf[tag_start..].to_vec();
                    self.carry_off = base + tag_start as u64;
                    return;
                }
            }
        }
        self.carry.clear();
    }

    /// Flushes pending bytes as literal content at end of body.
    pub fn finish(&mut self) {
        if !self.carry.is_empty() {
            let len = self.carry.len() as u64;
            let off = self.carry_off;
            self.carry.clear();
            self.push_literal(off, len);
        }
    }

    /// Takes the finished segment list.
    pub fn take_segments(&mut self) -> Vec<EsiSeg> {
        std::mem::take(&mut self.segs)
    }

    fn push_literal(&mut self, off: u64, len: u64) {
        if len == 0 {
            return;
        }
        if let Some(EsiSeg::Literal {
            off: last_off,
            len: last_len,
        }) = self.segs.last_mut()
            && *last_off + *last_len == off
        {
            *last_len += len;
            return;
        }
        self.segs.push(EsiSeg::Literal { off, len });
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Length of the longest buffer suffix that is a prefix of the include tag.
fn split_candidate_len(buf: &[u8]) -> usize {
    let max = buf.len().min(INCLUDE_TAG.len() - 1);
    for keep in (1..=max).rev() {
        if buf[buf.len() - keep..].eq_ignore_ascii_case(&INCLUDE_TAG[..keep]) {
            return keep;
        }
    }
    0
}

/// Pulls the `src` attribute out of an include tag.
fn extract_src(tag: &[u8]) -> Option<String> {
    let tag = std::str::from_utf8(tag).ok()?;
    let idx = tag.find("src=")?;
    let rest = &tag[idx + 4..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    let src = &rest[..end];
    if src.is_empty() { None } else { Some(src.to_string()) }
}
