// src/core/storage/mod.rs

//! Storage backends (stevedores) and the stored-object representation.
//!
//! The cache core never touches object bytes directly; it goes through the
//! stevedore capability set {has_attr, get_attr, iterate, get_len} and the
//! append interface used by the fetch pipeline.

pub mod object;
pub mod stevedore;

pub use object::{ObjAttr, ObjAttrs, StoredObject};
pub use stevedore::{MallocStevedore, Stevedore, StevedoreSet};
