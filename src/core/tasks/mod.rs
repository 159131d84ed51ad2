// src/core/tasks/mod.rs

//! Background tasks: the ban lurker. The expiry engine and the log mailman
//! live with their data structures and are spawned alongside these.

pub mod ban_lurker;
