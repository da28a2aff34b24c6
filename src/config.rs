//! Runtime configuration for the cache engine (§6's configuration table).
//!
//! `Config` is loaded once from the environment with [`envy`] and handed to the
//! [`crate::orchestrator::CacheOrchestrator`] constructor as an `Arc<Config>` — there
//! is no global configuration singleton. Hot-reload is out of scope for this
//! engine: a deployment that needs it swaps the whole `Arc<CacheOrchestrator>`
//! behind its own pointer rather than mutating `Config` in place.

use serde::Deserialize;

fn default_chunk_max_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_chunk_size_target() -> u64 {
    8 * 1024 * 1024
}

fn default_ttl_ok() -> i64 {
    86_400
}

fn default_ttl_redirects() -> i64 {
    3_600
}

fn default_ttl_client_error() -> i64 {
    60
}

fn default_ttl_server_error() -> i64 {
    10
}

fn default_version_ttl_multiplier() -> u32 {
    2
}

fn default_refresh_min_elapsed_pct() -> f64 {
    0.1
}

fn default_refresh_min_remaining_seconds() -> i64 {
    60
}

fn default_coalesce_max_entries() -> usize {
    1_000
}

fn default_coalesce_entry_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_coalesce_wait_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_fallback_enabled() -> bool {
    true
}

fn default_fallback_max_retries() -> u32 {
    1
}

fn default_bypass_query_params() -> Vec<String> {
    vec!["nocache".into(), "bypass".into(), "debug".into()]
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

fn default_debug_query_param() -> String {
    "debug".into()
}

fn default_concurrency_soft_limit() -> usize {
    64
}

fn default_concurrency_hard_limit() -> usize {
    256
}

/// Per-status-class TTLs, in seconds. A zero or negative value disables caching
/// for that status class (§4.7, "TTL selection by upstream status").
#[derive(Debug, Clone, Deserialize)]
pub struct TtlConfig {
    #[serde(default = "default_ttl_ok")]
    pub ok: i64,
    #[serde(default = "default_ttl_redirects", rename = "redirects")]
    pub redirects: i64,
    #[serde(default = "default_ttl_client_error", rename = "client_error")]
    pub client_error: i64,
    #[serde(default = "default_ttl_server_error", rename = "server_error")]
    pub server_error: i64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            ok: default_ttl_ok(),
            redirects: default_ttl_redirects(),
            client_error: default_ttl_client_error(),
            server_error: default_ttl_server_error(),
        }
    }
}

/// TTL-refresh thresholds (§4.5).
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_min_elapsed_pct")]
    pub min_elapsed_pct: f64,
    #[serde(default = "default_refresh_min_remaining_seconds")]
    pub min_remaining_seconds: i64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_elapsed_pct: default_refresh_min_elapsed_pct(),
            min_remaining_seconds: default_refresh_min_remaining_seconds(),
        }
    }
}

/// Coalescer sizing (§4.6, §9's LRU bounds invariant).
#[derive(Debug, Clone, Deserialize)]
pub struct CoalesceConfig {
    #[serde(default = "default_coalesce_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_coalesce_entry_ttl_ms")]
    pub entry_ttl_ms: u64,
    #[serde(default = "default_coalesce_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            max_entries: default_coalesce_max_entries(),
            entry_ttl_ms: default_coalesce_entry_ttl_ms(),
            wait_timeout_ms: default_coalesce_wait_timeout_ms(),
        }
    }
}

/// Fallback-pipeline behavior (§4.8).
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub bad_request_only: bool,
    #[serde(default = "default_fallback_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub preserve_headers: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_fallback_enabled(),
            bad_request_only: false,
            max_retries: default_fallback_max_retries(),
            preserve_headers: false,
        }
    }
}

/// Concurrency gate sizing for parallel chunk I/O (§4.9).
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_concurrency_soft_limit")]
    pub soft_limit: usize,
    #[serde(default = "default_concurrency_hard_limit")]
    pub hard_limit: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            soft_limit: default_concurrency_soft_limit(),
            hard_limit: default_concurrency_hard_limit(),
        }
    }
}

/// Top-level configuration, matching §6's table one field at a time.
///
/// Loaded via [`Config::from_env`], which reads `CACHE_*` environment variables
/// through [`envy`]; any field absent from the environment falls back to the
/// defaults documented in §6.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_chunk_max_bytes")]
    pub chunk_max_bytes: u64,
    #[serde(default = "default_chunk_size_target")]
    pub chunk_size_target: u64,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default = "default_version_ttl_multiplier")]
    pub version_ttl_multiplier: u32,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub coalesce: CoalesceConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default = "default_bypass_query_params")]
    pub bypass_query_params: Vec<String>,
    #[serde(default = "default_debug_query_param")]
    pub debug_query_param: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_max_bytes: default_chunk_max_bytes(),
            chunk_size_target: default_chunk_size_target(),
            ttl: TtlConfig::default(),
            version_ttl_multiplier: default_version_ttl_multiplier(),
            refresh: RefreshConfig::default(),
            coalesce: CoalesceConfig::default(),
            fallback: FallbackConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            bypass_query_params: default_bypass_query_params(),
            debug_query_param: default_debug_query_param(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl Config {
    /// Loads configuration from `CACHE_*` environment variables, falling back to
    /// defaults for anything unset. Nested structs (`ttl`, `refresh`, ...) are not
    /// individually env-addressable by envy's flat model; deployments that need to
    /// override a single nested field construct `Config::default()` and mutate it
    /// directly before wrapping it in an `Arc`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CACHE_").from_env::<Self>()
    }

    /// TTL in seconds for a given upstream status code, per §4.7's selection rule.
    pub fn ttl_for_status(&self, status: http::StatusCode) -> i64 {
        if status.is_success() {
            self.ttl.ok
        } else if status.is_redirection() {
            self.ttl.redirects
        } else if status.is_client_error() {
            self.ttl.client_error
        } else {
            self.ttl.server_error
        }
    }
}
