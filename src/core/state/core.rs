// src/core/state/core.rs

//! Defines the central `ServerState` struct, holding all shared proxy state.

use super::stats::StatsState;
use crate::config::Config;
use crate::core::CitrineError;
use crate::core::ban::BanEngine;
use crate::core::director::{BackendTimeouts, Director, StaticDirector, TcpBackend};
use crate::core::expiry::ExpiryEngine;
use crate::core::fetch::FetchEnv;
use crate::core::fetch::freshness::FreshnessDefaults;
use crate::core::objstore::ObjStore;
use crate::core::req::ReqEnv;
use crate::core::storage::stevedore::StevedoreSet;
use crate::core::vcl::{VclEvent, VclProgram, builtin_program};
use crate::core::vsl::{VslRecord, VslSink};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Contains all initialized components required to spawn the proxy's
/// background tasks. Created once during initialization and consumed by the
/// spawner.
pub struct ServerInit {
    /// The fully initialized, shared proxy state.
    pub state: Arc<ServerState>,
    /// The expiry engine, run as a background task.
    pub expiry: ExpiryEngine,
    /// Receives record batches for the log mailman task.
    pub vsl_rx: mpsc::Receiver<Vec<VslRecord>>,
}

/// The central struct holding all shared, proxy-wide state.
#[derive(Debug)]
pub struct ServerState {
    /// The runtime configuration. Wrapped in a Mutex so management commands
    /// can adjust parameters.
    pub config: Arc<Mutex<Config>>,
    /// The digest-keyed object store.
    pub store: Arc<ObjStore>,
    /// The ban engine; also reachable through the store.
    pub bans: Arc<BanEngine>,
    /// The active director. Swappable at runtime.
    pub director: RwLock<Arc<dyn Director>>,
    /// The active directive program. Swappable at runtime.
    pub vcl: RwLock<Arc<VclProgram>>,
    /// The sending half of the transaction log plane.
    pub vsl: VslSink,
    /// Proxy-wide counters.
    pub stats: StatsState,
    /// Open client sessions, bounded by `max_sessions`.
    pub open_sessions: AtomicUsize,
    /// Session id allocator.
    pub next_sess_id: AtomicU64,
    /// A handle to the logging filter for dynamic log level changes.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    /// The request-FSM environment snapshot, rebuilt on reconfiguration.
    req_env: RwLock<ReqEnv>,
}

impl ServerState {
    /// Initializes the entire proxy state from the given configuration.
    pub fn initialize(
        config: Config,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<ServerInit, CitrineError> {
        let (vsl, vsl_rx) = VslSink::new();

        let bans = Arc::new(BanEngine::new());
        let stevedores =
            StevedoreSet::new(config.storage.malloc_size, config.storage.transient_size);
        let store = ObjStore::new(bans.clone(), stevedores, config.cache.lru_timeout);

        let (expiry, exp_tx) = ExpiryEngine::new(store.clone(), config.cache.clock_step);
        store.set_expiry(exp_tx);

        let backend_addr: SocketAddr = format!("{}:{}", config.backend.host, config.backend.port)
            .parse()
            .map_err(|e| {
                CitrineError::Internal(format!(
                    "unresolvable backend address {}:{}: {e}",
                    config.backend.host, config.backend.port
                ))
            })?;
        let backend = TcpBackend::new("default", backend_addr, config.limits.http_max_hdr);
        let director: Arc<dyn Director> = StaticDirector::new("default", backend);

        let program = builtin_program();
        program.event(VclEvent::Load);
        program.event(VclEvent::Warm);
        info!("directive program '{}' active", program.name);

        let req_env = build_req_env(&config, &store, &director, &program, &vsl);

        let state = Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            store,
            bans,
            director: RwLock::new(director),
            vcl: RwLock::new(program),
            vsl,
            stats: StatsState::new(),
            open_sessions: AtomicUsize::new(0),
            next_sess_id: AtomicU64::new(1),
            log_reload_handle,
            req_env: RwLock::new(req_env),
        });

        Ok(ServerInit {
            state,
            expiry,
            vsl_rx,
        })
    }

    /// The current request-FSM environment snapshot.
    pub async fn req_env(&self) -> ReqEnv {
        self.req_env.read().await.clone()
    }

    /// Installs a new directive program and rebuilds the environment
    /// snapshot, as the management layer does on `vcl.load`.
    pub async fn set_program(&self, program: Arc<VclProgram>) {
        program.event(VclEvent::Load);
        program.event(VclEvent::Warm);
        let config = self.config.lock().await.clone();
        let director = self.director.read().await.clone();
        let env = build_req_env(&config, &self.store, &director, &program, &self.vsl);
        *self.vcl.write().await = program;
        *self.req_env.write().await = env;
    }
}

fn build_req_env(
    config: &Config,
    store: &Arc<ObjStore>,
    director: &Arc<dyn Director>,
    program: &Arc<VclProgram>,
    vsl: &VslSink,
) -> ReqEnv {
    ReqEnv {
        fetch: FetchEnv {
            store: store.clone(),
            director: director.clone(),
            program: program.clone(),
            defaults: FreshnessDefaults {
                ttl: config.cache.default_ttl,
                grace: config.cache.default_grace,
                keep: config.cache.default_keep,
            },
            timeouts: BackendTimeouts {
                connect: config.timeouts.connect_timeout,
                first_byte: config.timeouts.first_byte_timeout,
                between_bytes: config.timeouts.between_bytes_timeout,
            },
            max_retries: config.max_retries,
            shortlived: config.cache.shortlived,
            gzip_enabled: config.features.http_gzip_support,
            gzip_level: config.features.gzip_level,
            workspace_backend: config.workspace_backend,
            vsl: vsl.clone(),
        },
        max_restarts: config.max_restarts,
        max_esi_depth: config.max_esi_depth,
        range_support: config.features.http_range_support,
        timeout_req: config.timeouts.timeout_req,
        between_bytes: config.timeouts.between_bytes_timeout,
        workspace_client: config.workspace_client,
    }
}
