// src/core/objstore/vary.rs

//! Vary handling: building the serialized vary description from a backend
//! response, and matching a stored description against a new request.

use crate::core::CitrineError;
use crate::core::http::{HttpMsg, decode_headers, encode_headers};
use bytes::Bytes;

/// The outcome of building a vary description.
#[derive(Debug)]
pub enum VaryBuild {
    /// The response does not vary.
    None,
    /// The serialized description to store with the object.
    Desc(Bytes),
    /// `Vary: *`; the response can never be matched.
    Star,
}

/// Builds the vary description for a response: for each header named by
/// `Vary`, the value the matching request carried (empty when absent).
pub fn build(beresp: &HttpMsg, req: &HttpMsg) -> Result<VaryBuild, CitrineError> {
    let Some(vary) = beresp.get_str("vary") else {
        return Ok(VaryBuild::None);
    };
    let mut fields: Vec<(Bytes, Bytes)> = Vec::new();
    for name in vary.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if name == "*" {
            return Ok(VaryBuild::Star);
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(CitrineError::Protocol(format!(
                "illegal Vary field name '{name}'"
            )));
        }
        let value = req.get(name).cloned().unwrap_or_default();
        fields.push((Bytes::copy_from_slice(name.as_bytes()), value));
    }
    if fields.is_empty() {
        return Ok(VaryBuild::None);
    }
    Ok(VaryBuild::Desc(Bytes::from(encode_headers(&fields))))
}

/// Matches a stored vary description against a request: every recorded header
/// must carry the recorded value (absent headers match the empty value).
pub fn matches(desc: &[u8], req: &HttpMsg) -> bool {
    let Ok(fields) = decode_headers(desc) else {
        return false;
    };
    for (name, stored_value) in fields {
        let current = match std::str::from_utf8(&name) {
            Ok(n) => req.get(n).cloned().unwrap_or_default(),
            Err(_) => return false,
        };
        if current != stored_value {
            return false;
        }
    }
    true
}
