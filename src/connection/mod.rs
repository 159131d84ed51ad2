// src/connection/mod.rs

//! Manages the lifecycle of a single client TCP connection: request
//! decoding, request-FSM dispatch, and session state management.

mod handler;
pub mod session;

pub use handler::ConnectionHandler;
pub use session::{Session, StreamClose};
