// src/core/vcl/privs.rs

//! Task-scoped private storage for extension state.
//!
//! Each task (request, fetch, session) carries a tree of `(owner id →
//! private)` entries. An entry holds an opaque value and an optional
//! finalizer; finalizers run at task teardown in reverse insertion order.
//! The `top` variant on the session shares storage across ESI-nested
//! requests under the session mutex.

use std::any::Any;
use std::fmt;

/// Identifies the extension owning a private slot.
pub type PrivId = u64;

type PrivData = Box<dyn Any + Send>;
type PrivFini = Box<dyn FnOnce(PrivData) + Send>;

struct PrivEntry {
    id: PrivId,
    data: Option<PrivData>,
    fini: Option<PrivFini>,
}

/// The per-task private storage tree.
#[derive(Default)]
pub struct TaskPrivs {
    entries: Vec<PrivEntry>,
}

impl fmt::Debug for TaskPrivs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPrivs")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl TaskPrivs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value for `id`, replacing any previous one (its finalizer
    /// runs immediately).
    pub fn set(
        &mut self,
        id: PrivId,
        data: PrivData,
        fini: Option<Box<dyn FnOnce(PrivData) + Send>>,
    ) {
        self.remove(id);
        self.entries.push(PrivEntry {
            id,
            data: Some(data),
            fini,
        });
    }

    /// Borrows the value for `id`.
    pub fn get(&self, id: PrivId) -> Option<&(dyn Any + Send)> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.data.as_deref())
    }

    /// Borrows the value for `id` mutably.
    pub fn get_mut(&mut self, id: PrivId) -> Option<&mut (dyn Any + Send)> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .and_then(|e| e.data.as_deref_mut())
    }

    /// Drops the entry for `id`, running its finalizer.
    pub fn remove(&mut self, id: PrivId) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            let mut entry = self.entries.remove(pos);
            if let (Some(data), Some(fini)) = (entry.data.take(), entry.fini.take()) {
                fini(data);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for TaskPrivs {
    /// Finalizers run in reverse insertion order.
    fn drop(&mut self) {
        while let Some(mut entry) = self.entries.pop() {
            if let (Some(data), Some(fini)) = (entry.data.take(), entry.fini.take()) {
                fini(data);
            }
        }
    }
}
