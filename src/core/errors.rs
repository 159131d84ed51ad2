// src/core/errors.rs

//! Defines the primary error type for the entire application.

use crate::connection::session::StreamClose;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the proxy.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum CitrineError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request header overflow")]
    HeaderOverflow,

    #[error("Too many headers")]
    TooManyHeaders,

    #[error("Workspace overflow")]
    WorkspaceOverflow,

    #[error("Storage allocation failed")]
    StorageFull,

    #[error("Object attribute missing: {0}")]
    AttrMissing(&'static str),

    #[error("Backend fetch failed: {0}")]
    FetchFailed(String),

    #[error("Backend unresolvable")]
    NoBackend,

    #[error("Fetch body error: {0}")]
    BodyError(String),

    #[error("Filter error: {0}")]
    FilterError(String),

    #[error("Directive failure in {0}")]
    VclFailure(&'static str),

    #[error("Illegal directive return from {sub}: {action}")]
    IllegalReturn { sub: String, action: &'static str },

    #[error("Directive recursion detected in {0}")]
    VclRecursion(String),

    #[error("Invalid ban specification: {0}")]
    BadBan(String),

    #[error("Range not satisfiable")]
    RangeUnsatisfiable,

    #[error("ESI depth exceeded")]
    EsiDepthExceeded,

    #[error("Max restarts exceeded")]
    MaxRestarts,

    #[error("Session closed: {0}")]
    SessClosed(StreamClose),

    #[error("Timed out")]
    Timeout,

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for CitrineError {
    fn clone(&self) -> Self {
        match self {
            CitrineError::Io(e) => CitrineError::Io(Arc::clone(e)),
            CitrineError::IncompleteData => CitrineError::IncompleteData,
            CitrineError::Protocol(s) => CitrineError::Protocol(s.clone()),
            CitrineError::HeaderOverflow => CitrineError::HeaderOverflow,
            CitrineError::TooManyHeaders => CitrineError::TooManyHeaders,
            CitrineError::WorkspaceOverflow => CitrineError::WorkspaceOverflow,
            CitrineError::StorageFull => CitrineError::StorageFull,
            CitrineError::AttrMissing(a) => CitrineError::AttrMissing(a),
            CitrineError::FetchFailed(s) => CitrineError::FetchFailed(s.clone()),
            CitrineError::NoBackend => CitrineError::NoBackend,
            CitrineError::BodyError(s) => CitrineError::BodyError(s.clone()),
            CitrineError::FilterError(s) => CitrineError::FilterError(s.clone()),
            CitrineError::VclFailure(s) => CitrineError::VclFailure(s),
            CitrineError::IllegalReturn { sub, action } => CitrineError::IllegalReturn {
                sub: sub.clone(),
                action,
            },
            CitrineError::VclRecursion(s) => CitrineError::VclRecursion(s.clone()),
            CitrineError::BadBan(s) => CitrineError::BadBan(s.clone()),
            CitrineError::RangeUnsatisfiable => CitrineError::RangeUnsatisfiable,
            CitrineError::EsiDepthExceeded => CitrineError::EsiDepthExceeded,
            CitrineError::MaxRestarts => CitrineError::MaxRestarts,
            CitrineError::SessClosed(r) => CitrineError::SessClosed(*r),
            CitrineError::Timeout => CitrineError::Timeout,
            CitrineError::Internal(s) => CitrineError::Internal(s.clone()),
        }
    }
}

impl PartialEq for CitrineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CitrineError::Io(e1), CitrineError::Io(e2)) => e1.to_string() == e2.to_string(),
            (CitrineError::Protocol(s1), CitrineError::Protocol(s2)) => s1 == s2,
            (CitrineError::FetchFailed(s1), CitrineError::FetchFailed(s2)) => s1 == s2,
            (CitrineError::BodyError(s1), CitrineError::BodyError(s2)) => s1 == s2,
            (CitrineError::FilterError(s1), CitrineError::FilterError(s2)) => s1 == s2,
            (CitrineError::VclFailure(s1), CitrineError::VclFailure(s2)) => s1 == s2,
            (CitrineError::VclRecursion(s1), CitrineError::VclRecursion(s2)) => s1 == s2,
            (CitrineError::BadBan(s1), CitrineError::BadBan(s2)) => s1 == s2,
            (CitrineError::AttrMissing(s1), CitrineError::AttrMissing(s2)) => s1 == s2,
            (CitrineError::SessClosed(r1), CitrineError::SessClosed(r2)) => r1 == r2,
            (CitrineError::Internal(s1), CitrineError::Internal(s2)) => s1 == s2,
            (
                CitrineError::IllegalReturn {
                    sub: s1,
                    action: a1,
                },
                CitrineError::IllegalReturn {
                    sub: s2,
                    action: a2,
                },
            ) => s1 == s2 && a1 == a2,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for CitrineError {
    fn from(e: std::io::Error) -> Self {
        CitrineError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for CitrineError {
    fn from(e: std::str::Utf8Error) -> Self {
        CitrineError::Protocol(format!("invalid UTF-8 in header: {e}"))
    }
}

impl From<std::num::ParseIntError> for CitrineError {
    fn from(e: std::num::ParseIntError) -> Self {
        CitrineError::Protocol(format!("invalid numeric field: {e}"))
    }
}

impl From<serde_json::Error> for CitrineError {
    fn from(e: serde_json::Error) -> Self {
        CitrineError::Internal(format!("JSON serialization error: {e}"))
    }
}
