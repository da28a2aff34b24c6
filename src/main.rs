//! Binary entry point: loads configuration, wires the collaborator
//! implementations and the core engine components together, and starts the
//! server loop. All glue; no business logic lives here (§10.3).

use std::env;
use std::sync::Arc;
use std::time::Duration;

use rimcache::client::{HttpOriginFetcher, HttpStorageOrigin, HttpTransformer};
use rimcache::coalescer::RequestCoalescer;
use rimcache::collaborators::{OriginFetcher, StorageOrigin};
use rimcache::config::Config;
use rimcache::orchestrator::CacheOrchestrator;
use rimcache::primitives::ConcurrencyGate;
use rimcache::refresher::{RefreshThresholds, TtlRefresher};
use rimcache::store::{ChunkLockManager, ChunkedBlobStore, InMemoryKv};
use rimcache::telemetry::{EventSink, TracingSink};
use rimcache::version::{InMemoryVersionBackend, VersionRegistry};

/// Tee capacity for the coalescer's stream-tee broadcast channel: how many
/// chunks a slow waiter can lag behind the owner before it drops messages.
const COALESCE_TEE_CAPACITY: usize = 64;

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    #[cfg(feature = "tracing-subscriber")]
    rimcache::telemetry::init_tracing();

    let config = Arc::new(Config::from_env().unwrap_or_else(|err| {
        eprintln!("CACHE_* config error, falling back to defaults: {err}");
        Config::default()
    }));

    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);

    let kv = Arc::new(InMemoryKv::default());
    let locks = Arc::new(ChunkLockManager::new());
    let io_gate = Arc::new(ConcurrencyGate::new(
        config.concurrency.soft_limit,
        config.concurrency.hard_limit,
    ));
    let store = Arc::new(ChunkedBlobStore::with_io_gate(
        kv,
        locks,
        config.chunk_max_bytes,
        config.chunk_size_target,
        io_gate,
    ));

    let version_backend = Arc::new(InMemoryVersionBackend::default());
    let versions = Arc::new(VersionRegistry::new(version_backend, sink.clone()));

    let coalescer = Arc::new(RequestCoalescer::new(
        config.coalesce.max_entries,
        Duration::from_millis(config.coalesce.entry_ttl_ms),
        Duration::from_millis(config.coalesce.wait_timeout_ms),
        COALESCE_TEE_CAPACITY,
        sink.clone(),
    ));

    let refresher = Arc::new(TtlRefresher::new(
        RefreshThresholds {
            min_elapsed_pct: config.refresh.min_elapsed_pct,
            min_remaining_seconds: config.refresh.min_remaining_seconds,
        },
        Duration::from_secs(60),
        sink.clone(),
    ));

    let transform_base_url = env_or("CACHE_TRANSFORM_BASE_URL", "http://127.0.0.1:9001");
    let transformer = Arc::new(HttpTransformer::new(Duration::from_millis(
        config.upstream_timeout_ms,
    )));

    let origin: Option<Arc<dyn OriginFetcher>> = env::var("CACHE_ORIGIN_BASE_URL")
        .ok()
        .map(|url| Arc::new(HttpOriginFetcher::new(url)) as Arc<dyn OriginFetcher>);

    let storage_origin: Option<Arc<dyn StorageOrigin>> = env::var("CACHE_STORAGE_ORIGIN_BASE_URL")
        .ok()
        .map(|url| Arc::new(HttpStorageOrigin::new(url)) as Arc<dyn StorageOrigin>);

    let orchestrator = Arc::new(CacheOrchestrator::new(
        config,
        store,
        versions,
        coalescer,
        refresher,
        transformer,
        origin,
        storage_origin,
        transform_base_url,
        sink.clone(),
    ));

    let bind_addr = env_or("CACHE_BIND_ADDR", "0.0.0.0:8080");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {bind_addr}: {err}"));

    rimcache::serve(listener, orchestrator, sink).await;
}
