//! Shared test harness: fake collaborators and a helper that boots a real
//! [`rimcache::CacheOrchestrator`] behind a real `hyper` server on a loopback
//! socket, so integration tests drive the engine exactly the way a client
//! would rather than calling `handle()` with a hand-built request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;

use rimcache::coalescer::RequestCoalescer;
use rimcache::collaborators::{
    BoxByteStream, OriginFetcher, StorageOrigin, Transformer, TransformRequest, UpstreamResponse,
};
use rimcache::config::Config;
use rimcache::error::{OriginError, UpstreamError};
use rimcache::orchestrator::CacheOrchestrator;
use rimcache::primitives::ConcurrencyGate;
use rimcache::refresher::{RefreshThresholds, TtlRefresher};
use rimcache::store::{ChunkLockManager, ChunkedBlobStore, InMemoryKv};
use rimcache::telemetry::NullSink;
use rimcache::version::{InMemoryVersionBackend, VersionRegistry};

fn bytes_stream(body: Vec<u8>) -> BoxByteStream {
    Box::pin(futures_util::stream::once(async move {
        Ok::<_, std::io::Error>(Bytes::from(body))
    }))
}

/// A scripted upstream transform response.
pub enum Scripted {
    Ok { body: Vec<u8>, content_type: &'static str },
    /// A `206 Partial Content` response, which the store must never cache
    /// (§4.3's partial content policy, invariant 8).
    Partial { body: Vec<u8>, content_type: &'static str },
    Err(UpstreamError),
}

/// A `Transformer` whose behavior is chosen by a callback keyed on the call
/// index, so tests can script "fail once, then succeed" sequences (S5) or a
/// fixed canned body (S1-S4), and observe how many times it was actually
/// invoked (S6, S7's single-flight invariant).
pub struct FakeTransformer {
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<TransformRequest>>,
    behavior: Box<dyn Fn(usize, &TransformRequest) -> Scripted + Send + Sync>,
    delay: Duration,
}

impl FakeTransformer {
    pub fn canned(body: Vec<u8>, content_type: &'static str) -> Self {
        Self::scripted(move |_, _| Scripted::Ok {
            body: body.clone(),
            content_type,
        })
    }

    pub fn scripted<F>(behavior: F) -> Self
    where
        F: Fn(usize, &TransformRequest) -> Scripted + Send + Sync + 'static,
    {
        Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            behavior: Box::new(behavior),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transformer for FakeTransformer {
    async fn transform(&self, request: &TransformRequest) -> Result<UpstreamResponse, UpstreamError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        match (self.behavior)(index, request) {
            Scripted::Ok { body, content_type } => {
                let mut headers = HeaderMap::new();
                headers.insert(http::header::CONTENT_TYPE, content_type.parse().unwrap());
                Ok(UpstreamResponse {
                    status: StatusCode::OK,
                    content_length: Some(body.len() as u64),
                    body: bytes_stream(body),
                    headers,
                })
            }
            Scripted::Partial { body, content_type } => {
                let mut headers = HeaderMap::new();
                headers.insert(http::header::CONTENT_TYPE, content_type.parse().unwrap());
                headers.insert(
                    http::header::CONTENT_RANGE,
                    format!("bytes 0-{}/{}", body.len().saturating_sub(1), body.len() * 2)
                        .parse()
                        .unwrap(),
                );
                Ok(UpstreamResponse {
                    status: StatusCode::PARTIAL_CONTENT,
                    content_length: Some(body.len() as u64),
                    body: bytes_stream(body),
                    headers,
                })
            }
            Scripted::Err(err) => Err(err),
        }
    }
}

/// An origin/storage-origin fake that always fails; most scenarios exercise
/// the engine with no origin collaborators configured at all (`origin: None`
/// in `build_orchestrator`), matching a deployment that only wired the
/// transformer.
pub struct UnavailableOrigin;

#[async_trait::async_trait]
impl OriginFetcher for UnavailableOrigin {
    async fn fetch(&self, _source_path: &str, _passthrough_headers: &HeaderMap) -> Result<UpstreamResponse, OriginError> {
        Err(OriginError::Unavailable)
    }
}

#[async_trait::async_trait]
impl StorageOrigin for UnavailableOrigin {
    async fn fetch(&self, _source_path: &str) -> Result<UpstreamResponse, OriginError> {
        Err(OriginError::Unavailable)
    }
}

/// Builds a `CacheOrchestrator` from a fresh, fully in-memory component set,
/// binds it to an ephemeral loopback port, and starts serving in the
/// background. Returns the address to connect to.
pub async fn spawn_server(config: Config, transformer: Arc<dyn Transformer>) -> SocketAddr {
    let config = Arc::new(config);
    let sink = Arc::new(NullSink);

    let io_gate = Arc::new(ConcurrencyGate::new(
        config.concurrency.soft_limit,
        config.concurrency.hard_limit,
    ));
    let store = Arc::new(ChunkedBlobStore::with_io_gate(
        Arc::new(InMemoryKv::default()),
        Arc::new(ChunkLockManager::new()),
        config.chunk_max_bytes,
        config.chunk_size_target,
        io_gate,
    ));
    let versions = Arc::new(VersionRegistry::new(
        Arc::new(InMemoryVersionBackend::default()),
        sink.clone(),
    ));
    let coalescer = Arc::new(RequestCoalescer::new(
        config.coalesce.max_entries,
        Duration::from_millis(config.coalesce.entry_ttl_ms),
        Duration::from_millis(config.coalesce.wait_timeout_ms),
        64,
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

    let orchestrator = Arc::new(CacheOrchestrator::new(
        config,
        store,
        versions,
        coalescer,
        refresher,
        transformer,
        None,
        None,
        "http://upstream.test",
        sink.clone(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(rimcache::serve(listener, orchestrator, sink));
    addr
}

/// Issues `GET path` (optionally with a `Range` header) against a server
/// spawned by [`spawn_server`] and returns the response with its body fully
/// collected, so assertions can inspect both headers and bytes.
pub async fn get(addr: SocketAddr, path: &str, range: Option<&str>) -> (http::response::Parts, Bytes) {
    use http_body_util::{BodyExt, Empty};
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::TokioExecutor;

    let client = Client::builder(TokioExecutor::new()).build::<_, Empty<Bytes>>(HttpConnector::new());
    let uri: http::Uri = format!("http://{addr}{path}").parse().unwrap();
    let mut builder = hyper::Request::builder().method(hyper::Method::GET).uri(uri);
    if let Some(range) = range {
        builder = builder.header(http::header::RANGE, range);
    }
    let req = builder.body(Empty::<Bytes>::new()).unwrap();

    let response = client.request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    let collected = body.collect().await.unwrap().to_bytes();
    (parts, collected)
}
