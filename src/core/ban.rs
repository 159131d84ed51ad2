// src/core/ban.rs

//! The ban engine: an append-only list of invalidation predicates.
//!
//! A ban is a conjunction of tests over object attributes and, optionally,
//! request attributes. Objects are checked lazily at lookup against every ban
//! newer than their ban pointer; a background lurker eagerly retires
//! object-only bans so the list stays short.

use crate::core::CitrineError;
use crate::core::http::{HttpMsg, decode_headers};
use crate::core::metrics;
use crate::core::objstore::objcore::ObjCore;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

/// The attribute a ban test inspects.
#[derive(Debug, Clone)]
pub enum BanField {
    /// `req.url`; forces lookup-time evaluation.
    ReqUrl,
    /// `req.http.<name>`; forces lookup-time evaluation.
    ReqHttp(String),
    /// `obj.status`.
    ObjStatus,
    /// `obj.http.<name>`.
    ObjHttp(String),
}

impl BanField {
    fn touches_req(&self) -> bool {
        matches!(self, BanField::ReqUrl | BanField::ReqHttp(_))
    }
}

/// The comparison operator of a ban test.
#[derive(Debug, Clone)]
pub enum BanOp {
    Eq,
    Ne,
    Match(Regex),
    NoMatch(Regex),
}

/// One `field op operand` test.
#[derive(Debug, Clone)]
pub struct BanTest {
    pub field: BanField,
    pub op: BanOp,
    pub operand: String,
}

impl BanTest {
    fn eval_value(&self, value: Option<&str>) -> bool {
        let value = value.unwrap_or("");
        match &self.op {
            BanOp::Eq => value == self.operand,
            BanOp::Ne => value != self.operand,
            BanOp::Match(re) => re.is_match(value),
            BanOp::NoMatch(re) => !re.is_match(value),
        }
    }
}

/// One ban: a conjunction of tests, linked in insertion order.
#[derive(Debug)]
pub struct Ban {
    /// Monotone insertion sequence; higher is newer.
    pub seq: u64,
    pub time: SystemTime,
    pub tests: Vec<BanTest>,
    /// True when any test reads request attributes.
    pub req_touching: bool,
    completed: AtomicBool,
    /// Number of object cores whose ban pointer rests on this ban.
    oc_refs: AtomicU64,
}

impl Ban {
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub fn oc_refs(&self) -> u64 {
        self.oc_refs.load(Ordering::Acquire)
    }

    pub(crate) fn take_oc_ref(&self) {
        self.oc_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_oc_ref(&self) {
        self.oc_refs.fetch_sub(1, Ordering::AcqRel);
    }

    /// Evaluates the conjunction against an object (and request, when the
    /// caller has one). Returns `None` when a req-touching test cannot be
    /// evaluated without a request.
    fn eval(&self, obj_view: &BanObjView<'_>, req: Option<&HttpMsg>) -> Option<bool> {
        for test in &self.tests {
            let hit = match &test.field {
                BanField::ReqUrl => {
                    let req = req?;
                    test.eval_value(std::str::from_utf8(&req.url).ok())
                }
                BanField::ReqHttp(name) => {
                    let req = req?;
                    test.eval_value(req.get_str(name))
                }
                BanField::ObjStatus => test.eval_value(Some(&obj_view.status.to_string())),
                BanField::ObjHttp(name) => test.eval_value(obj_view.header(name)),
            };
            metrics::BAN_TESTS_TOTAL.inc();
            if !hit {
                return Some(false);
            }
        }
        Some(true)
    }
}

/// A decoded view of an object's banable attributes.
struct BanObjView<'a> {
    status: u16,
    headers: &'a [(bytes::Bytes, bytes::Bytes)],
}

impl BanObjView<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }
}

/// Verdict of a ban check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanVerdict {
    /// No ban applies; the object's ban pointer was advanced to the head.
    Clean,
    /// A ban matched; the object must be dropped.
    Hit,
    /// Req-touching bans remain that could not be evaluated (lurker only);
    /// the pointer was advanced past the evaluated suffix where possible.
    Deferred,
}

/// The engine owning the ban list. Insertion is serialized by the list
/// mutex; readers take the head as their upper bound once at entry.
#[derive(Debug)]
pub struct BanEngine {
    /// Front of the deque is the newest ban.
    bans: Mutex<VecDeque<Arc<Ban>>>,
    next_seq: AtomicU64,
}

impl Default for BanEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BanEngine {
    pub fn new() -> Self {
        let engine = Self {
            bans: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
        };
        // The list is never empty: a completed sentinel marks the beginning
        // of time, so every object has a ban to point at.
        let sentinel = Arc::new(Ban {
            seq: 0,
            time: SystemTime::UNIX_EPOCH,
            tests: Vec::new(),
            req_touching: false,
            completed: AtomicBool::new(true),
            oc_refs: AtomicU64::new(0),
        });
        engine.bans.lock().push_back(sentinel);
        engine
    }

    /// Appends a new ban at the head of the list.
    pub fn add(&self, tests: Vec<BanTest>) -> Result<Arc<Ban>, CitrineError> {
        if tests.is_empty() {
            return Err(CitrineError::BadBan("empty ban expression".into()));
        }
        let req_touching = tests.iter().any(|t| t.field.touches_req());
        let ban = Arc::new(Ban {
            seq: self.next_seq.fetch_add(1, Ordering::AcqRel),
            time: SystemTime::now(),
            tests,
            req_touching,
            completed: AtomicBool::new(false),
            oc_refs: AtomicU64::new(0),
        });
        self.bans.lock().push_front(ban.clone());
        metrics::BANS_ADDED_TOTAL.inc();
        Ok(ban)
    }

    /// Parses a ban expression of the form
    /// `field op operand [&& field op operand ...]`, e.g.
    /// `obj.status == 500 && req.url ~ ^/api/`.
    pub fn add_spec(&self, spec: &str) -> Result<Arc<Ban>, CitrineError> {
        let mut tests = Vec::new();
        for clause in spec.split("&&") {
            let mut parts = clause.trim().splitn(3, char::is_whitespace);
            let (Some(field), Some(op), Some(operand)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(CitrineError::BadBan(format!(
                    "expected 'field op operand' in '{clause}'"
                )));
            };
            let field = if field == "req.url" {
                BanField::ReqUrl
            } else if let Some(name) = field.strip_prefix("req.http.") {
                BanField::ReqHttp(name.to_string())
            } else if field == "obj.status" {
                BanField::ObjStatus
            } else if let Some(name) = field.strip_prefix("obj.http.") {
                BanField::ObjHttp(name.to_string())
            } else {
                return Err(CitrineError::BadBan(format!("unknown field '{field}'")));
            };
            let operand = operand.trim().to_string();
            let op = match op {
                "==" => BanOp::Eq,
                "!=" => BanOp::Ne,
                "~" => BanOp::Match(
                    Regex::new(&operand)
                        .map_err(|e| CitrineError::BadBan(format!("bad regex: {e}")))?,
                ),
                "!~" => BanOp::NoMatch(
                    Regex::new(&operand)
                        .map_err(|e| CitrineError::BadBan(format!("bad regex: {e}")))?,
                ),
                _ => return Err(CitrineError::BadBan(format!("unknown operator '{op}'"))),
            };
            tests.push(BanTest { field, op, operand });
        }
        self.add(tests)
    }

    /// The newest ban.
    pub fn head(&self) -> Arc<Ban> {
        self.bans.lock().front().cloned().expect("ban list empty")
    }

    pub fn len(&self) -> usize {
        self.bans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        // The sentinel does not count.
        self.len() <= 1
    }

    /// Bans newer than `seq`, oldest first.
    fn newer_than(&self, seq: u64) -> Vec<Arc<Ban>> {
        let bans = self.bans.lock();
        bans.iter()
            .take_while(|b| b.seq > seq)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Checks an object against all bans newer than its pointer.
    ///
    /// With a request (lookup time) every ban can be evaluated; without one
    /// (lurker) req-touching bans stop the walk and the verdict is
    /// `Deferred`. On a clean walk the pointer advances to the head taken at
    /// entry.
    pub fn check_oc(&self, oc: &Arc<ObjCore>, req: Option<&HttpMsg>) -> BanVerdict {
        let oc_seq = oc.ban_ref().map(|b| b.seq).unwrap_or(0);
        let pending = self.newer_than(oc_seq);
        if pending.is_empty() {
            return BanVerdict::Clean;
        }

        let Some(obj) = oc.obj() else {
            // A busy object has no attributes to test yet.
            return BanVerdict::Deferred;
        };
        let attrs = obj.attrs();
        let headers = match decode_headers(&attrs.headers) {
            Ok(h) => h,
            Err(_) => Vec::new(),
        };
        let view = BanObjView {
            status: attrs.status,
            headers: &headers,
        };

        let mut advanced_to: Option<Arc<Ban>> = None;
        for ban in pending {
            match ban.eval(&view, req) {
                Some(true) => {
                    metrics::BAN_KILLS_TOTAL.inc();
                    return BanVerdict::Hit;
                }
                Some(false) => advanced_to = Some(ban),
                None => {
                    // A req-touching ban without a request: stop here so the
                    // ban is re-evaluated at the next lookup.
                    if let Some(ban) = advanced_to {
                        oc.set_ban_ref(ban);
                    }
                    return BanVerdict::Deferred;
                }
            }
        }
        if let Some(ban) = advanced_to {
            oc.set_ban_ref(ban);
        }
        BanVerdict::Clean
    }

    /// Marks bans completed once every older object has been checked past
    /// them, then trims the purely-completed tail. `oldest_unchecked` is the
    /// smallest ban sequence any surviving object still points at.
    pub fn sweep_completed(&self, oldest_unchecked: u64) {
        let mut bans = self.bans.lock();
        for ban in bans.iter() {
            if ban.seq <= oldest_unchecked && !ban.req_touching {
                ban.mark_completed();
            }
        }
        // Drop completed tail bans nothing references anymore. The sentinel
        // stays.
        while bans.len() > 1 {
            let last = bans.back().unwrap();
            let next_to_last_completed = bans.get(bans.len() - 2).unwrap().completed();
            if last.completed() && last.oc_refs() == 0 && next_to_last_completed {
                bans.pop_back();
            } else {
                break;
            }
        }
    }
}
