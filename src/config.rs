// src/config.rs

//! Manages proxy configuration: loading, validation and runtime defaults.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Limits on the client request head.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct HttpLimits {
    /// Maximum bytes in a request head.
    #[serde(default = "default_http_req_size")]
    pub http_req_size: usize,
    /// Maximum bytes in a backend response head.
    #[serde(default = "default_http_resp_size")]
    pub http_resp_size: usize,
    /// Maximum number of headers per message.
    #[serde(default = "default_http_max_hdr")]
    pub http_max_hdr: usize,
}

fn default_http_req_size() -> usize {
    32 * 1024
}
fn default_http_resp_size() -> usize {
    32 * 1024
}
fn default_http_max_hdr() -> usize {
    64
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            http_req_size: default_http_req_size(),
            http_resp_size: default_http_resp_size(),
            http_max_hdr: default_http_max_hdr(),
        }
    }
}

/// Every blocking operation has a deadline.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Idle time before a session is closed between requests.
    #[serde(with = "humantime_serde", default = "default_timeout_idle")]
    pub timeout_idle: Duration,
    /// Grace period for draining a session at shutdown.
    #[serde(with = "humantime_serde", default = "default_timeout_linger")]
    pub timeout_linger: Duration,
    /// Deadline for one blocking request step (parked lookup, header wait).
    #[serde(with = "humantime_serde", default = "default_timeout_req")]
    pub timeout_req: Duration,
    /// Maximum wait for the next body byte from a backend.
    #[serde(with = "humantime_serde", default = "default_between_bytes_timeout")]
    pub between_bytes_timeout: Duration,
    /// Maximum wait for the first response byte from a backend.
    #[serde(with = "humantime_serde", default = "default_first_byte_timeout")]
    pub first_byte_timeout: Duration,
    /// Backend connect deadline.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Whole-response transmit deadline.
    #[serde(with = "humantime_serde", default = "default_send_timeout")]
    pub send_timeout: Duration,
    /// Idle transmit deadline between body chunks.
    #[serde(with = "humantime_serde", default = "default_idle_send_timeout")]
    pub idle_send_timeout: Duration,
}

fn default_timeout_idle() -> Duration {
    Duration::from_secs(5)
}
fn default_timeout_linger() -> Duration {
    Duration::from_millis(50)
}
fn default_timeout_req() -> Duration {
    Duration::from_secs(60)
}
fn default_between_bytes_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_first_byte_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_connect_timeout() -> Duration {
    Duration::from_millis(3500)
}
fn default_send_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_idle_send_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_idle: default_timeout_idle(),
            timeout_linger: default_timeout_linger(),
            timeout_req: default_timeout_req(),
            between_bytes_timeout: default_between_bytes_timeout(),
            first_byte_timeout: default_first_byte_timeout(),
            connect_timeout: default_connect_timeout(),
            send_timeout: default_send_timeout(),
            idle_send_timeout: default_idle_send_timeout(),
        }
    }
}

/// TTL, grace and eviction tuning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct CacheTuning {
    /// TTL for responses without freshness information.
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub default_ttl: Duration,
    /// Grace applied when the origin specifies none.
    #[serde(with = "humantime_serde", default = "default_grace")]
    pub default_grace: Duration,
    /// Keep window for conditional refreshes.
    #[serde(with = "humantime_serde", default = "default_keep")]
    pub default_keep: Duration,
    /// Objects with less effective life than this go to transient storage.
    #[serde(with = "humantime_serde", default = "default_shortlived")]
    pub shortlived: Duration,
    /// Minimum interval between LRU touches for one object.
    #[serde(with = "humantime_serde", default = "default_lru_timeout")]
    pub lru_timeout: Duration,
    /// Ban list length above which the lurker evicts instead of testing.
    /// `0` disables the cutoff.
    #[serde(default)]
    pub ban_cutoff: usize,
    /// Wall-clock steps beyond this are logged and clamped.
    #[serde(with = "humantime_serde", default = "default_clock_step")]
    pub clock_step: Duration,
}

fn default_ttl() -> Duration {
    Duration::from_secs(120)
}
fn default_grace() -> Duration {
    Duration::from_secs(10)
}
fn default_keep() -> Duration {
    Duration::ZERO
}
fn default_shortlived() -> Duration {
    Duration::from_secs(10)
}
fn default_lru_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_clock_step() -> Duration {
    Duration::from_secs(1)
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            default_grace: default_grace(),
            default_keep: default_keep(),
            shortlived: default_shortlived(),
            lru_timeout: default_lru_timeout(),
            ban_cutoff: 0,
            clock_step: default_clock_step(),
        }
    }
}

/// Protocol feature switches.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct FeatureConfig {
    #[serde(default = "default_true")]
    pub http_range_support: bool,
    #[serde(default = "default_true")]
    pub http_gzip_support: bool,
    #[serde(default = "default_gzip_level")]
    pub gzip_level: u32,
}

fn default_true() -> bool {
    true
}
fn default_gzip_level() -> u32 {
    6
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            http_range_support: true,
            http_gzip_support: true,
            gzip_level: default_gzip_level(),
        }
    }
}

/// Worker-thread sizing hints handed to the async runtime.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct PoolConfig {
    #[serde(default = "default_pool_min")]
    pub thread_pool_min: usize,
    #[serde(default = "default_pool_max")]
    pub thread_pool_max: usize,
    /// Workers held back for fetch and rush tasks under load.
    #[serde(default = "default_pool_reserve")]
    pub thread_pool_reserve: usize,
}

fn default_pool_min() -> usize {
    10
}
fn default_pool_max() -> usize {
    100
}
fn default_pool_reserve() -> usize {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_pool_min: default_pool_min(),
            thread_pool_max: default_pool_max(),
            thread_pool_reserve: default_pool_reserve(),
        }
    }
}

/// Storage sizing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct StorageConfig {
    /// Main cache budget in bytes.
    #[serde(default = "default_malloc_size")]
    pub malloc_size: u64,
    /// Transient (shortlived/private) budget in bytes.
    #[serde(default = "default_transient_size")]
    pub transient_size: u64,
}

fn default_malloc_size() -> u64 {
    256 * 1024 * 1024
}
fn default_transient_size() -> u64 {
    64 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            malloc_size: default_malloc_size(),
            transient_size: default_transient_size(),
        }
    }
}

/// The default backend to fetch from.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}
fn default_backend_port() -> u16 {
    8080
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9131
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_max_sessions")]
    max_sessions: usize,
    #[serde(default = "default_max_restarts")]
    max_restarts: u32,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_max_esi_depth")]
    max_esi_depth: u32,
    #[serde(default = "default_workspace_client")]
    workspace_client: usize,
    #[serde(default = "default_workspace_backend")]
    workspace_backend: usize,
    #[serde(default)]
    limits: HttpLimits,
    #[serde(default)]
    timeouts: TimeoutConfig,
    #[serde(default)]
    cache: CacheTuning,
    #[serde(default)]
    features: FeatureConfig,
    #[serde(default)]
    pool: PoolConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    backend: BackendConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6081
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_sessions() -> usize {
    10000
}
fn default_max_restarts() -> u32 {
    4
}
fn default_max_retries() -> u32 {
    4
}
fn default_max_esi_depth() -> u32 {
    5
}
fn default_workspace_client() -> usize {
    64 * 1024
}
fn default_workspace_backend() -> usize {
    64 * 1024
}

/// The final, validated proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_sessions: usize,
    pub max_restarts: u32,
    pub max_retries: u32,
    pub max_esi_depth: u32,
    pub workspace_client: usize,
    pub workspace_backend: usize,
    pub limits: HttpLimits,
    pub timeouts: TimeoutConfig,
    pub cache: CacheTuning,
    pub features: FeatureConfig,
    pub pool: PoolConfig,
    pub storage: StorageConfig,
    pub backend: BackendConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_sessions: default_max_sessions(),
            max_restarts: default_max_restarts(),
            max_retries: default_max_retries(),
            max_esi_depth: default_max_esi_depth(),
            workspace_client: default_workspace_client(),
            workspace_backend: default_workspace_backend(),
            limits: HttpLimits::default(),
            timeouts: TimeoutConfig::default(),
            cache: CacheTuning::default(),
            features: FeatureConfig::default(),
            pool: PoolConfig::default(),
            storage: StorageConfig::default(),
            backend: BackendConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            max_sessions: raw.max_sessions,
            max_restarts: raw.max_restarts,
            max_retries: raw.max_retries,
            max_esi_depth: raw.max_esi_depth,
            workspace_client: raw.workspace_client,
            workspace_backend: raw.workspace_backend,
            limits: raw.limits,
            timeouts: raw.timeouts,
            cache: raw.cache,
            features: raw.features,
            pool: raw.pool,
            storage: raw.storage,
            backend: raw.backend,
            metrics: raw.metrics,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_sessions == 0 {
            return Err(anyhow!("max_sessions cannot be 0"));
        }
        if self.backend.port == 0 {
            return Err(anyhow!("backend.port cannot be 0"));
        }
        if self.backend.host.trim().is_empty() {
            return Err(anyhow!("backend.host cannot be empty"));
        }
        if self.workspace_client < 4096 || self.workspace_backend < 4096 {
            return Err(anyhow!("workspaces must be at least 4KB"));
        }
        if self.limits.http_max_hdr == 0 {
            return Err(anyhow!("limits.http_max_hdr cannot be 0"));
        }
        if self.limits.http_req_size < 1024 || self.limits.http_resp_size < 1024 {
            return Err(anyhow!("http head size limits must be at least 1KB"));
        }
        if self.features.gzip_level > 9 {
            return Err(anyhow!("features.gzip_level must be 0..=9"));
        }
        if self.pool.thread_pool_min > self.pool.thread_pool_max {
            return Err(anyhow!("pool.thread_pool_min exceeds thread_pool_max"));
        }
        if self.pool.thread_pool_reserve >= self.pool.thread_pool_max {
            return Err(anyhow!("pool.thread_pool_reserve must be below thread_pool_max"));
        }
        if self.storage.malloc_size == 0 || self.storage.transient_size == 0 {
            return Err(anyhow!("storage budgets cannot be 0"));
        }
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main listen port"
                ));
            }
        }
        Ok(())
    }
}
