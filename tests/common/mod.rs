// tests/common/mod.rs

//! Shared fixtures: a scriptable mock backend/director, an in-memory
//! delivery sink, and environment builders.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use citrine::connection::session::{Session, StreamClose};
use citrine::core::CitrineError;
use citrine::core::ban::BanEngine;
use citrine::core::director::{Backend, BackendTimeouts, BackendTxn, Director, DirectorEvent};
use citrine::core::expiry::ExpiryEngine;
use citrine::core::fetch::FetchEnv;
use citrine::core::fetch::filters::BodySource;
use citrine::core::fetch::freshness::FreshnessDefaults;
use citrine::core::http::{BodyFraming, HttpMsg};
use citrine::core::objstore::ObjStore;
use citrine::core::proto::http1::WireFraming;
use citrine::core::req::deliver::DeliverySink;
use citrine::core::req::{Req, ReqEnv};
use citrine::core::storage::stevedore::StevedoreSet;
use citrine::core::vcl::{VclProgram, builtin_program};
use citrine::core::vsl::{VslRecord, VslSink};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// One scripted backend response.
#[derive(Debug, Clone)]
pub struct CannedResp {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<Bytes>,
    pub framing: BodyFraming,
    /// Delay before the head, and between body chunks.
    pub chunk_delay: Option<Duration>,
}

impl CannedResp {
    pub fn ok(body: &str, cache_control: &str) -> Self {
        Self {
            status: 200,
            reason: "OK",
            headers: vec![
                ("content-length", body.len().to_string()),
                ("cache-control", cache_control.to_string()),
                ("content-type", "text/plain".to_string()),
            ],
            body: vec![Bytes::copy_from_slice(body.as_bytes())],
            framing: BodyFraming::Length(body.len() as u64),
            chunk_delay: None,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    pub fn not_modified() -> Self {
        Self {
            status: 304,
            reason: "Not Modified",
            headers: vec![("cache-control", "max-age=60".to_string())],
            body: vec![],
            framing: BodyFraming::None,
            chunk_delay: None,
        }
    }

    fn to_msg(&self) -> HttpMsg {
        let mut msg = HttpMsg::new_response(b"HTTP/1.1", self.status, self.reason.as_bytes());
        for (n, v) in &self.headers {
            msg.set(n, Bytes::copy_from_slice(v.as_bytes()));
        }
        msg
    }
}

/// A body source draining scripted chunks, optionally slowly.
struct ScriptedSource {
    chunks: VecDeque<Bytes>,
    delay: Option<Duration>,
}

#[async_trait]
impl BodySource for ScriptedSource {
    async fn recv(&mut self) -> Result<Option<Bytes>, CitrineError> {
        let Some(chunk) = self.chunks.pop_front() else {
            return Ok(None);
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Some(chunk))
    }
}

/// A backend running a script of responses; the last entry repeats.
#[derive(Debug)]
pub struct MockBackend {
    script: Mutex<VecDeque<CannedResp>>,
    pub calls: AtomicU64,
    pub fail_connect: Mutex<u64>,
}

impl MockBackend {
    pub fn new(script: Vec<CannedResp>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU64::new(0),
            fail_connect: Mutex::new(0),
        })
    }

    /// Makes the next `n` gethdrs calls fail, as a dead backend would.
    pub fn fail_next(&self, n: u64) {
        *self.fail_connect.lock() = n;
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn getip(&self) -> Option<IpAddr> {
        Some(IpAddr::from([127, 0, 0, 1]))
    }

    async fn gethdrs(
        &self,
        _bereq: &HttpMsg,
        _body: Option<Bytes>,
        _timeouts: &BackendTimeouts,
    ) -> Result<BackendTxn, CitrineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut fails = self.fail_connect.lock();
            if *fails > 0 {
                *fails -= 1;
                return Err(CitrineError::FetchFailed("scripted connect failure".into()));
            }
        }
        let resp = {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().expect("script exhausted")
            }
        };
        if let Some(delay) = resp.chunk_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(BackendTxn {
            beresp: resp.to_msg(),
            framing: resp.framing,
            body: Box::new(ScriptedSource {
                chunks: resp.body.clone().into(),
                delay: resp.chunk_delay,
            }),
        })
    }

    async fn pipe(&self, _bereq: &HttpMsg, _client: &mut tokio::net::TcpStream) -> StreamClose {
        StreamClose::TxPipe
    }

    fn finish(&self) {}
}

/// A director always resolving to one mock backend.
#[derive(Debug)]
pub struct MockDirector {
    pub backend: Arc<MockBackend>,
}

impl MockDirector {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

#[async_trait]
impl Director for MockDirector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn resolve(&self) -> Result<Arc<dyn Backend>, CitrineError> {
        Ok(self.backend.clone() as Arc<dyn Backend>)
    }

    fn healthy(&self, changed: &mut Option<SystemTime>) -> bool {
        *changed = None;
        true
    }

    fn list(&self, _json: bool, _verbose: bool) -> String {
        "mock healthy".to_string()
    }

    fn event(&self, _ev: DirectorEvent) {}
}

/// Everything a test environment owns; dropping it tears the plumbing down.
pub struct TestEnv {
    pub env: ReqEnv,
    pub store: Arc<ObjStore>,
    pub bans: Arc<BanEngine>,
    pub expiry: ExpiryEngine,
    pub vsl_rx: mpsc::Receiver<Vec<VslRecord>>,
}

/// Builds a request-FSM environment over a mock director and the builtin
/// program.
pub fn test_env(director: Arc<dyn Director>) -> TestEnv {
    test_env_with_program(director, builtin_program())
}

pub fn test_env_with_program(director: Arc<dyn Director>, program: Arc<VclProgram>) -> TestEnv {
    let (vsl, vsl_rx) = VslSink::new();
    let bans = Arc::new(BanEngine::new());
    let stevedores = StevedoreSet::new(64 * 1024 * 1024, 16 * 1024 * 1024);
    let store = ObjStore::new(bans.clone(), stevedores, Duration::from_millis(10));
    let (expiry, exp_tx) = ExpiryEngine::new(store.clone(), Duration::from_secs(1));
    store.set_expiry(exp_tx);

    let env = ReqEnv {
        fetch: FetchEnv {
            store: store.clone(),
            director,
            program,
            defaults: FreshnessDefaults {
                ttl: Duration::from_secs(120),
                grace: Duration::from_secs(10),
                keep: Duration::ZERO,
            },
            timeouts: BackendTimeouts {
                connect: Duration::from_secs(2),
                first_byte: Duration::from_secs(5),
                between_bytes: Duration::from_secs(5),
            },
            max_retries: 2,
            shortlived: Duration::from_secs(1),
            gzip_enabled: true,
            gzip_level: 6,
            workspace_backend: 64 * 1024,
            vsl,
        },
        max_restarts: 3,
        max_esi_depth: 5,
        range_support: true,
        timeout_req: Duration::from_secs(10),
        between_bytes: Duration::from_secs(5),
        workspace_client: 64 * 1024,
    };
    TestEnv {
        env,
        store,
        bans,
        expiry,
        vsl_rx,
    }
}

pub fn make_sess() -> Arc<Session> {
    let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let local: SocketAddr = "127.0.0.1:6081".parse().unwrap();
    Arc::new(Session::new(1, peer, local))
}

pub fn make_req(env: &ReqEnv, method: &str, url: &str, headers: &[(&str, &str)]) -> Req {
    let mut http = HttpMsg::new_request(method.as_bytes(), url.as_bytes(), b"HTTP/1.1");
    http.set("host", &b"test.example.com"[..]);
    for (n, v) in headers {
        http.set(n, Bytes::copy_from_slice(v.as_bytes()));
    }
    Req::new(make_sess(), http, None, env)
}

/// The digest the builtin hash phase would derive for `url` with the
/// fixture Host.
pub fn digest_for(url: &str) -> citrine::core::objstore::Digest {
    use citrine::core::objstore::HashAccum;
    let mut accum = HashAccum::new();
    accum.update(url.as_bytes());
    accum.update(b"test.example.com");
    accum.finalize()
}

/// Plants a finished object in the store by walking the real miss path.
pub fn insert_object(
    store: &Arc<ObjStore>,
    env: &ReqEnv,
    url: &str,
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
    ttl: Duration,
    grace: Duration,
    keep: Duration,
) -> Arc<citrine::core::objstore::objcore::ObjCore> {
    use citrine::core::http::encode_headers;
    use citrine::core::objstore::objcore::OcTtl;
    use citrine::core::objstore::{Lookup, LookupParams};
    use citrine::core::storage::object::ObjAttrs;
    use citrine::core::storage::stevedore::Stevedore;

    let req = make_req(env, "GET", url, &[]);
    let lookup = store.lookup(LookupParams {
        digest: digest_for(url),
        req: &req.http,
        xid: 42,
        grace_limit: None,
        hash_ignore_busy: false,
    });
    let Lookup::Miss(handle) = lookup else {
        panic!("expected a miss inserting {url}");
    };

    let stv = store.stevedores.main.clone();
    let obj = stv.alloc_obj().unwrap();
    let hdrs: Vec<(Bytes, Bytes)> = headers
        .iter()
        .map(|(n, v)| {
            (
                Bytes::copy_from_slice(n.as_bytes()),
                Bytes::copy_from_slice(v.as_bytes()),
            )
        })
        .collect();
    obj.set_attrs(ObjAttrs {
        status,
        reason: b"OK".to_vec(),
        proto: b"HTTP/1.1".to_vec(),
        headers: encode_headers(&hdrs),
        len: body.len() as u64,
        xid: 42,
        ..Default::default()
    });
    stv.charge(body.len() as u64).unwrap();
    obj.append(Bytes::copy_from_slice(body));
    handle.oc.set_obj(obj, stv);
    handle.oc.set_ttl_state(OcTtl {
        t_origin: SystemTime::now(),
        ttl,
        grace,
        keep,
    });

    use citrine::core::objstore::boc::BocState;
    handle.boc.set_state(BocState::ReqDone);
    store.unbusy(&handle);
    handle.boc.set_state(BocState::Finished);

    let oc = handle.oc.clone();
    store.deref_oc(&handle.oc);
    if let Some(stale) = &handle.stale {
        store.deref_oc(stale);
    }
    oc
}

/// Collects delivery events in memory.
#[derive(Debug, Default)]
pub struct CollectorSink {
    pub head: Option<(HttpMsg, WireFraming)>,
    pub body: BytesMut,
    pub finished: bool,
    /// Timestamps of body arrivals, for streaming assertions.
    pub chunk_times: Vec<std::time::Instant>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.head.as_ref().map(|(h, _)| h.status).unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head
            .as_ref()
            .and_then(|(h, _)| h.get_str(name).map(|s| s.to_string()))
    }

    pub fn body_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }
}

#[async_trait]
impl DeliverySink for CollectorSink {
    async fn send_head(
        &mut self,
        resp: &HttpMsg,
        framing: WireFraming,
    ) -> Result<(), CitrineError> {
        self.head = Some((resp.clone(), framing));
        Ok(())
    }

    async fn send_body(&mut self, _flush: bool, data: Bytes) -> Result<(), CitrineError> {
        self.chunk_times.push(std::time::Instant::now());
        self.body.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), CitrineError> {
        self.finished = true;
        Ok(())
    }
}
