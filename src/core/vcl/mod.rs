// src/core/vcl/mod.rs

//! The directive runtime.
//!
//! A directive program is immutable after build: named subs with a methods
//! bitmask (where the sub may be called from), a returns bitmask (the
//! dispositions it may pick) and a body. The FSMs dispatch into it at named
//! phases; return values flow back through a single action word.

pub mod builtin;
pub mod privs;
pub mod runtime;

pub use builtin::builtin_program;
pub use runtime::{VclCtx, call_sub, dispatch};

use crate::core::CitrineError;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::Arc;
use strum_macros::Display;

/// The FSM phases a sub can be invoked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum VclMethod {
    Recv,
    Pipe,
    Pass,
    Hash,
    Purge,
    Miss,
    Hit,
    Deliver,
    Synth,
    BackendFetch,
    BackendResponse,
    BackendError,
}

impl VclMethod {
    pub fn mask(self) -> MethodMask {
        match self {
            VclMethod::Recv => MethodMask::RECV,
            VclMethod::Pipe => MethodMask::PIPE,
            VclMethod::Pass => MethodMask::PASS,
            VclMethod::Hash => MethodMask::HASH,
            VclMethod::Purge => MethodMask::PURGE,
            VclMethod::Miss => MethodMask::MISS,
            VclMethod::Hit => MethodMask::HIT,
            VclMethod::Deliver => MethodMask::DELIVER,
            VclMethod::Synth => MethodMask::SYNTH,
            VclMethod::BackendFetch => MethodMask::BACKEND_FETCH,
            VclMethod::BackendResponse => MethodMask::BACKEND_RESPONSE,
            VclMethod::BackendError => MethodMask::BACKEND_ERROR,
        }
    }

    /// The conventional entry sub name for this phase.
    pub fn entry_name(self) -> &'static str {
        match self {
            VclMethod::Recv => "vcl_recv",
            VclMethod::Pipe => "vcl_pipe",
            VclMethod::Pass => "vcl_pass",
            VclMethod::Hash => "vcl_hash",
            VclMethod::Purge => "vcl_purge",
            VclMethod::Miss => "vcl_miss",
            VclMethod::Hit => "vcl_hit",
            VclMethod::Deliver => "vcl_deliver",
            VclMethod::Synth => "vcl_synth",
            VclMethod::BackendFetch => "vcl_backend_fetch",
            VclMethod::BackendResponse => "vcl_backend_response",
            VclMethod::BackendError => "vcl_backend_error",
        }
    }

    /// The dispositions the FSM accepts from this phase.
    pub fn legal_actions(self) -> ActionMask {
        match self {
            VclMethod::Recv => {
                ActionMask::LOOKUP
                    | ActionMask::PASS
                    | ActionMask::PIPE
                    | ActionMask::SYNTH
                    | ActionMask::PURGE
                    | ActionMask::FAIL
                    | ActionMask::RESTART
            }
            VclMethod::Pipe => ActionMask::PIPE | ActionMask::SYNTH | ActionMask::FAIL,
            VclMethod::Pass => {
                ActionMask::FETCH | ActionMask::SYNTH | ActionMask::RESTART | ActionMask::FAIL
            }
            VclMethod::Hash => ActionMask::LOOKUP | ActionMask::FAIL,
            VclMethod::Purge => ActionMask::SYNTH | ActionMask::RESTART | ActionMask::FAIL,
            VclMethod::Miss => {
                ActionMask::FETCH
                    | ActionMask::PASS
                    | ActionMask::SYNTH
                    | ActionMask::RESTART
                    | ActionMask::FAIL
            }
            VclMethod::Hit => {
                ActionMask::DELIVER
                    | ActionMask::MISS
                    | ActionMask::PASS
                    | ActionMask::SYNTH
                    | ActionMask::RESTART
                    | ActionMask::FAIL
            }
            VclMethod::Deliver => {
                ActionMask::DELIVER | ActionMask::SYNTH | ActionMask::RESTART | ActionMask::FAIL
            }
            VclMethod::Synth => ActionMask::DELIVER | ActionMask::RESTART | ActionMask::FAIL,
            VclMethod::BackendFetch => {
                ActionMask::FETCH | ActionMask::ABANDON | ActionMask::FAIL
            }
            VclMethod::BackendResponse => {
                ActionMask::DELIVER
                    | ActionMask::RETRY
                    | ActionMask::ABANDON
                    | ActionMask::PASS
                    | ActionMask::ERROR
                    | ActionMask::FAIL
            }
            VclMethod::BackendError => {
                ActionMask::DELIVER | ActionMask::RETRY | ActionMask::ABANDON | ActionMask::FAIL
            }
        }
    }
}

bitflags! {
    /// Bitmask over [`VclMethod`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodMask: u32 {
        const RECV             = 1 << 0;
        const PIPE             = 1 << 1;
        const PASS             = 1 << 2;
        const HASH             = 1 << 3;
        const PURGE            = 1 << 4;
        const MISS             = 1 << 5;
        const HIT              = 1 << 6;
        const DELIVER          = 1 << 7;
        const SYNTH            = 1 << 8;
        const BACKEND_FETCH    = 1 << 9;
        const BACKEND_RESPONSE = 1 << 10;
        const BACKEND_ERROR    = 1 << 11;
        const CLIENT = Self::RECV.bits() | Self::PIPE.bits() | Self::PASS.bits()
            | Self::HASH.bits() | Self::PURGE.bits() | Self::MISS.bits() | Self::HIT.bits()
            | Self::DELIVER.bits() | Self::SYNTH.bits();
        const BACKEND = Self::BACKEND_FETCH.bits() | Self::BACKEND_RESPONSE.bits()
            | Self::BACKEND_ERROR.bits();
    }
}

/// The dispositions a sub can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum VclAction {
    Lookup,
    Pass,
    Pipe,
    Synth,
    Purge,
    Fail,
    Restart,
    Miss,
    Deliver,
    Fetch,
    Retry,
    Abandon,
    Error,
}

impl VclAction {
    pub fn mask(self) -> ActionMask {
        match self {
            VclAction::Lookup => ActionMask::LOOKUP,
            VclAction::Pass => ActionMask::PASS,
            VclAction::Pipe => ActionMask::PIPE,
            VclAction::Synth => ActionMask::SYNTH,
            VclAction::Purge => ActionMask::PURGE,
            VclAction::Fail => ActionMask::FAIL,
            VclAction::Restart => ActionMask::RESTART,
            VclAction::Miss => ActionMask::MISS,
            VclAction::Deliver => ActionMask::DELIVER,
            VclAction::Fetch => ActionMask::FETCH,
            VclAction::Retry => ActionMask::RETRY,
            VclAction::Abandon => ActionMask::ABANDON,
            VclAction::Error => ActionMask::ERROR,
        }
    }

    pub fn as_static(self) -> &'static str {
        match self {
            VclAction::Lookup => "lookup",
            VclAction::Pass => "pass",
            VclAction::Pipe => "pipe",
            VclAction::Synth => "synth",
            VclAction::Purge => "purge",
            VclAction::Fail => "fail",
            VclAction::Restart => "restart",
            VclAction::Miss => "miss",
            VclAction::Deliver => "deliver",
            VclAction::Fetch => "fetch",
            VclAction::Retry => "retry",
            VclAction::Abandon => "abandon",
            VclAction::Error => "error",
        }
    }
}

bitflags! {
    /// Bitmask over [`VclAction`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ActionMask: u32 {
        const LOOKUP  = 1 << 0;
        const PASS    = 1 << 1;
        const PIPE    = 1 << 2;
        const SYNTH   = 1 << 3;
        const PURGE   = 1 << 4;
        const FAIL    = 1 << 5;
        const RESTART = 1 << 6;
        const MISS    = 1 << 7;
        const DELIVER = 1 << 8;
        const FETCH   = 1 << 9;
        const RETRY   = 1 << 10;
        const ABANDON = 1 << 11;
        const ERROR   = 1 << 12;
    }
}

/// A sub body. Bodies may call other subs through [`call_sub`].
pub type SubBody =
    Arc<dyn for<'a, 'b> Fn(&'a mut VclCtx<'b>, &'a VclProgram) -> Result<VclAction, CitrineError>
        + Send
        + Sync>;

/// One named subroutine of a program.
pub struct VclSub {
    pub name: String,
    pub methods: MethodMask,
    pub returns: ActionMask,
    /// Source coordinate, kept for call tracing.
    pub origin: String,
    pub body: SubBody,
}

impl std::fmt::Debug for VclSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VclSub")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .field("returns", &self.returns)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Program lifecycle events from the management layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VclEvent {
    Load,
    Warm,
    Cold,
    Discard,
}

/// A compiled directive program: numbered subs, phase entry points, and the
/// per-method legality data the dispatcher enforces.
#[derive(Debug)]
pub struct VclProgram {
    pub name: String,
    subs: Vec<VclSub>,
    by_name: HashMap<String, usize>,
}

impl VclProgram {
    pub fn builder(name: impl Into<String>) -> VclProgramBuilder {
        VclProgramBuilder {
            name: name.into(),
            subs: Vec::new(),
        }
    }

    pub fn sub(&self, idx: usize) -> Option<&VclSub> {
        self.subs.get(idx)
    }

    pub fn sub_idx(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn sub_count(&self) -> usize {
        self.subs.len()
    }

    /// The entry sub for a phase, when the program defines one.
    pub fn entry(&self, method: VclMethod) -> Option<usize> {
        self.sub_idx(method.entry_name())
    }

    /// Lifecycle notification. Programs hold no per-event state beyond the
    /// log trail.
    pub fn event(&self, ev: VclEvent) {
        tracing::debug!(program = %self.name, event = ?ev, "directive program event");
    }
}

/// Builds an immutable program.
pub struct VclProgramBuilder {
    name: String,
    subs: Vec<VclSub>,
}

impl VclProgramBuilder {
    /// Defines one sub. Recursion is rejected at dispatch, not here; the
    /// bitmap in the task context covers 64 subs per program.
    pub fn define(
        mut self,
        name: impl Into<String>,
        methods: MethodMask,
        returns: ActionMask,
        origin: impl Into<String>,
        body: SubBody,
    ) -> Self {
        self.subs.push(VclSub {
            name: name.into(),
            methods,
            returns,
            origin: origin.into(),
            body,
        });
        self
    }

    pub fn build(self) -> Result<Arc<VclProgram>, CitrineError> {
        if self.subs.len() > 64 {
            return Err(CitrineError::Internal(format!(
                "program '{}' has too many subs ({})",
                self.name,
                self.subs.len()
            )));
        }
        let mut by_name = HashMap::new();
        for (i, sub) in self.subs.iter().enumerate() {
            if by_name.insert(sub.name.clone(), i).is_some() {
                return Err(CitrineError::Internal(format!(
                    "duplicate sub '{}' in program '{}'",
                    sub.name, self.name
                )));
            }
        }
        Ok(Arc::new(VclProgram {
            name: self.name,
            subs: self.subs,
            by_name,
        }))
    }
}
