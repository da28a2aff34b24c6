//! ChunkedBlobStore (C3): an abstraction over a blob KV with a per-entry size
//! cap, transparently splitting bodies that would exceed it into a manifest plus
//! ordered chunk entries.
//!
//! The write path never holds more than one `chunk_size_target`-sized buffer in
//! memory: incoming bytes accumulate until a chunk's worth has arrived, that chunk
//! is flushed to the backend immediately, and only then does the writer start
//! accumulating the next one. Whether an artifact ends up stored as a single entry
//! or a manifest falls out of that streaming decision rather than being known in
//! advance — a body that never fills a second chunk-sized buffer is stored as a
//! single entry; anything larger becomes chunked, regardless of how far below
//! `chunk_max_bytes` it would otherwise fit. This keeps the "no operation holds
//! more than one chunk" invariant (§4.3) literally true on the write path, which
//! `chunk_size_target` (smaller than `chunk_max_bytes` by default) is specifically
//! sized to make cheap.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::primitives::{BoundedLru, ConcurrencyGate};
use crate::version::retry_with_backoff;

/// Artifact Metadata (§3's AM), stored alongside the blob or manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub source_path: String,
    pub mode: String,
    pub derivative: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub content_type: String,
    pub total_length: u64,
    pub cache_tags: Vec<String>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub version: u64,
    pub time: Option<String>,
    pub columns: Option<String>,
    pub rows: Option<String>,
    pub interval: Option<String>,
    pub duration: Option<String>,
    pub fps: Option<String>,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

/// The small metadata+index record describing a chunked artifact (§3's M).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub chunk_count: usize,
    pub chunk_size_target: u64,
    pub total_length: u64,
    pub chunk_keys: Vec<String>,
    pub per_chunk_lengths: Vec<u64>,
    pub metadata: ArtifactMetadata,
}

impl Manifest {
    /// Locates the chunks whose byte range overlaps `[a, b]`, returning their
    /// indices and each chunk's starting offset within the artifact.
    pub fn chunks_overlapping(&self, a: u64, b: u64) -> Vec<(usize, u64)> {
        let mut offset = 0u64;
        let mut out = Vec::new();
        for (i, len) in self.per_chunk_lengths.iter().enumerate() {
            let start = offset;
            let end = offset + len; // exclusive
            if end > a && start <= b {
                out.push((i, start));
            }
            offset = end;
        }
        out
    }
}

/// Either a directly-readable single-entry artifact or a chunked one behind a
/// manifest (§4.3's `get` contract).
pub enum StoredArtifact {
    Single {
        metadata: ArtifactMetadata,
        body: Bytes,
    },
    Chunked {
        metadata: ArtifactMetadata,
        manifest: Manifest,
    },
}

impl StoredArtifact {
    pub fn metadata(&self) -> &ArtifactMetadata {
        match self {
            StoredArtifact::Single { metadata, .. } => metadata,
            StoredArtifact::Chunked { metadata, .. } => metadata,
        }
    }
}

/// Raw key-value backend the blob store persists into. Production deployments
/// point this at their object store or KV of choice; [`InMemoryKv`] below backs
/// tests.
#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// An in-process KV backend, suitable for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryKv {
    table: Mutex<HashMap<String, Bytes>>,
}

#[async_trait::async_trait]
impl KvBackend for InMemoryKv {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.table.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.table.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.table.lock().remove(key);
        Ok(())
    }
}

fn meta_key(ci: &str) -> String {
    format!("{ci}::meta")
}

fn chunk_key(ci: &str, index: usize) -> String {
    format!("{ci}::chunk::{index}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The chunk-lock manager: concurrent writers to the same manifest serialize via
/// a process-local lock keyed by CI, with a 30s timeout (§4.3). A collision means
/// the late writer abandons storage — the response is still served — rather than
/// blocking.
pub struct ChunkLockManager {
    locks: BoundedLru<String, Instant>,
}

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

impl ChunkLockManager {
    pub fn new() -> Self {
        Self {
            locks: BoundedLru::new(10_000, LOCK_TIMEOUT),
        }
    }

    /// Attempts to take the lock for `ci`. Returns `false` (collision) if another
    /// writer already holds an unexpired lock.
    pub fn try_acquire(&self, ci: &str) -> bool {
        if self.locks.get(&ci.to_string()).is_some() {
            return false;
        }
        self.locks.set(ci.to_string(), Instant::now());
        true
    }

    pub fn release(&self, ci: &str) {
        self.locks.remove(&ci.to_string());
    }
}

impl Default for ChunkLockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The ChunkedBlobStore itself.
pub struct ChunkedBlobStore {
    backend: Arc<dyn KvBackend>,
    locks: Arc<ChunkLockManager>,
    chunk_max_bytes: u64,
    chunk_size_target: u64,
    io_gate: Arc<ConcurrencyGate>,
}

impl ChunkedBlobStore {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        locks: Arc<ChunkLockManager>,
        chunk_max_bytes: u64,
        chunk_size_target: u64,
    ) -> Self {
        Self::with_io_gate(backend, locks, chunk_max_bytes, chunk_size_target, Arc::new(ConcurrencyGate::new(64, 256)))
    }

    /// As [`ChunkedBlobStore::new`], but with an explicit [`ConcurrencyGate`]
    /// bounding parallel chunk reads/writes (§4.9) instead of the default
    /// soft/hard limits — callers typically size this from `Config::concurrency`.
    pub fn with_io_gate(
        backend: Arc<dyn KvBackend>,
        locks: Arc<ChunkLockManager>,
        chunk_max_bytes: u64,
        chunk_size_target: u64,
        io_gate: Arc<ConcurrencyGate>,
    ) -> Self {
        Self {
            backend,
            locks,
            chunk_max_bytes,
            chunk_size_target,
            io_gate,
        }
    }

    /// `put(CI, stream, metadata, ttl)`: streams the body into the store per the
    /// chunking decision described on the module (§4.3).
    ///
    /// `metadata.total_length` is overwritten with the length actually observed
    /// while streaming, since the upstream `Content-Length` (if any) is not
    /// trusted as authoritative.
    pub async fn put<S, E>(
        &self,
        ci: &str,
        mut stream: S,
        mut metadata: ArtifactMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        if !self.locks.try_acquire(ci) {
            return Err(StoreError::LockContended { ci: ci.to_string() });
        }
        let result = self.put_locked(ci, &mut stream, &mut metadata, ttl).await;
        self.locks.release(ci);
        result
    }

    async fn put_locked<S, E>(
        &self,
        ci: &str,
        stream: &mut S,
        metadata: &mut ArtifactMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let target = self.chunk_size_target.max(1) as usize;
        let mut buf = BytesMut::new();
        let mut total: u64 = 0;
        let mut chunk_keys = Vec::new();
        let mut per_chunk_lengths = Vec::new();
        let mut chunked_mode = false;

        loop {
            match stream.next().await {
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    total += bytes.len() as u64;
                    while buf.len() >= target {
                        chunked_mode = true;
                        let chunk = buf.split_to(target).freeze();
                        self.write_chunk(ci, chunk_keys.len(), chunk, &mut chunk_keys, &mut per_chunk_lengths)
                            .await?;
                    }
                }
                Some(Err(err)) => {
                    return Err(StoreError::Terminal(err.to_string()));
                }
                None => break,
            }
        }

        metadata.total_length = total;
        metadata.expires_at_ms = now_ms() + ttl.as_millis() as u64;
        metadata.created_at_ms = metadata.created_at_ms.min(now_ms());

        if !chunked_mode {
            // Never exceeded one chunk's worth of data: store as a single entry.
            let body = buf.freeze();
            self.write_single(ci, body, metadata).await
        } else {
            if !buf.is_empty() {
                let tail = buf.freeze();
                self.write_chunk(ci, chunk_keys.len(), tail, &mut chunk_keys, &mut per_chunk_lengths)
                    .await?;
            }
            self.write_manifest(ci, chunk_keys, per_chunk_lengths, metadata, total)
                .await
        }
    }

    async fn write_chunk(
        &self,
        ci: &str,
        index: usize,
        chunk: Bytes,
        chunk_keys: &mut Vec<String>,
        per_chunk_lengths: &mut Vec<u64>,
    ) -> Result<(), StoreError> {
        let key = chunk_key(ci, index);
        let len = chunk.len() as u64;
        let _permit = self
            .io_gate
            .acquire()
            .await
            .map_err(|e| StoreError::Terminal(e.to_string()))?;
        let backend = self.backend.clone();
        let key_clone = key.clone();
        retry_with_backoff(|| {
            let backend = backend.clone();
            let key = key_clone.clone();
            let chunk = chunk.clone();
            async move { backend.put(&key, chunk).await }
        })
        .await?;
        chunk_keys.push(key);
        per_chunk_lengths.push(len);
        Ok(())
    }

    async fn write_single(
        &self,
        ci: &str,
        body: Bytes,
        metadata: &ArtifactMetadata,
    ) -> Result<(), StoreError> {
        if metadata.total_length > self.chunk_max_bytes {
            // A single in-memory buffer exceeded the per-entry ceiling without
            // ever crossing chunk_size_target (target misconfigured larger than
            // the ceiling); refuse rather than write an oversized single entry.
            return Err(StoreError::Terminal(format!(
                "artifact of {} bytes exceeds chunk_max_bytes {} without chunking",
                metadata.total_length, self.chunk_max_bytes
            )));
        }
        let meta_bytes = serde_json::to_vec(metadata)
            .map_err(|e| StoreError::Terminal(e.to_string()))?;
        let backend = self.backend.clone();
        let ci_owned = ci.to_string();
        retry_with_backoff(|| {
            let backend = backend.clone();
            let ci = ci_owned.clone();
            let body = body.clone();
            async move { backend.put(&ci, body).await }
        })
        .await?;
        let meta_key_owned = meta_key(ci);
        let backend = self.backend.clone();
        retry_with_backoff(|| {
            let backend = backend.clone();
            let key = meta_key_owned.clone();
            let meta_bytes = Bytes::from(meta_bytes.clone());
            async move { backend.put(&key, meta_bytes).await }
        })
        .await
    }

    async fn write_manifest(
        &self,
        ci: &str,
        chunk_keys: Vec<String>,
        per_chunk_lengths: Vec<u64>,
        metadata: &ArtifactMetadata,
        total_length: u64,
    ) -> Result<(), StoreError> {
        let manifest = Manifest {
            chunk_count: chunk_keys.len(),
            chunk_size_target: self.chunk_size_target,
            total_length,
            chunk_keys,
            per_chunk_lengths,
            metadata: metadata.clone(),
        };
        let bytes = serde_json::to_vec(&manifest).map_err(|e| StoreError::Terminal(e.to_string()))?;
        // Manifest is written strictly after all chunks it references (§5).
        let backend = self.backend.clone();
        let ci_owned = ci.to_string();
        retry_with_backoff(|| {
            let backend = backend.clone();
            let ci = ci_owned.clone();
            let bytes = Bytes::from(bytes.clone());
            async move { backend.put(&ci, bytes).await }
        })
        .await
    }

    /// `get(CI) → StoredArtifact`. Reads metadata/manifest first and only pulls
    /// chunk bodies on demand via [`ChunkedBlobStore::read_chunk`].
    pub async fn get(&self, ci: &str) -> Result<Option<StoredArtifact>, StoreError> {
        if let Some(meta_bytes) = self.backend.get(&meta_key(ci)).await? {
            let metadata: ArtifactMetadata = serde_json::from_slice(&meta_bytes)
                .map_err(|e| StoreError::Terminal(e.to_string()))?;
            let body = self.backend.get(ci).await?.unwrap_or_default();
            return Ok(Some(StoredArtifact::Single { metadata, body }));
        }
        if let Some(manifest_bytes) = self.backend.get(ci).await? {
            let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
                .map_err(|e| StoreError::Terminal(e.to_string()))?;
            return Ok(Some(StoredArtifact::Chunked {
                metadata: manifest.metadata.clone(),
                manifest,
            }));
        }
        Ok(None)
    }

    /// Reads a single chunk's bytes by index, for the range slicer and for
    /// streaming a full chunked body to a response.
    pub async fn read_chunk(&self, manifest: &Manifest, index: usize) -> Result<Bytes, StoreError> {
        let key = manifest
            .chunk_keys
            .get(index)
            .ok_or_else(|| StoreError::Terminal(format!("chunk index {index} out of range")))?;
        let _permit = self
            .io_gate
            .acquire()
            .await
            .map_err(|e| StoreError::Terminal(e.to_string()))?;
        self.backend
            .get(key)
            .await?
            .ok_or_else(|| StoreError::ManifestMismatch {
                ci: key.clone(),
                expected: manifest.chunk_count,
                found: index,
            })
    }

    /// `delete(CI)`: removes manifest/metadata and every chunk it references.
    pub async fn delete(&self, ci: &str) -> Result<(), StoreError> {
        if let Some(StoredArtifact::Chunked { manifest, .. }) = self.get(ci).await? {
            for key in &manifest.chunk_keys {
                self.backend.delete(key).await?;
            }
        }
        self.backend.delete(&meta_key(ci)).await?;
        self.backend.delete(ci).await?;
        Ok(())
    }

    /// Rewrites an artifact's expiry without touching its body or chunks (§4.5's
    /// "metadata-only rewrite"). Returns `Ok(true)` if a rewrite happened, `Ok(false)`
    /// if no entry exists for `ci` (the refresher should skip rather than recreate).
    pub async fn refresh_ttl(
        &self,
        ci: &str,
        current: &ArtifactMetadata,
        new_ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut updated = current.clone();
        updated.expires_at_ms = now_ms() + new_ttl.as_millis() as u64;

        match self.get(ci).await? {
            Some(StoredArtifact::Single { .. }) => {
                let meta_bytes =
                    serde_json::to_vec(&updated).map_err(|e| StoreError::Terminal(e.to_string()))?;
                retry_with_backoff(|| {
                    let backend = self.backend.clone();
                    let key = meta_key(ci);
                    let meta_bytes = Bytes::from(meta_bytes.clone());
                    async move { backend.put(&key, meta_bytes).await }
                })
                .await?;
                Ok(true)
            }
            Some(StoredArtifact::Chunked { manifest, .. }) => {
                let mut manifest = manifest;
                manifest.metadata = updated;
                let bytes =
                    serde_json::to_vec(&manifest).map_err(|e| StoreError::Terminal(e.to_string()))?;
                retry_with_backoff(|| {
                    let backend = self.backend.clone();
                    let ci_owned = ci.to_string();
                    let bytes = Bytes::from(bytes.clone());
                    async move { backend.put(&ci_owned, bytes).await }
                })
                .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Whether an upstream response was itself partial content — such bodies must
/// never be persisted (§4.3's partial-content policy, §8 invariant 8).
pub fn is_partial_response(status: http::StatusCode, headers: &http::HeaderMap) -> bool {
    status == http::StatusCode::PARTIAL_CONTENT || headers.contains_key(http::header::CONTENT_RANGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn metadata(len: u64) -> ArtifactMetadata {
        ArtifactMetadata {
            source_path: "a.mp4".into(),
            mode: "video".into(),
            derivative: None,
            width: None,
            height: None,
            content_type: "video/mp4".into(),
            total_length: len,
            cache_tags: vec![],
            created_at_ms: 0,
            expires_at_ms: 0,
            version: 0,
            time: None,
            columns: None,
            rows: None,
            interval: None,
            duration: None,
            fps: None,
            extensions: HashMap::new(),
        }
    }

    fn store(chunk_max: u64, chunk_target: u64) -> ChunkedBlobStore {
        ChunkedBlobStore::new(
            Arc::new(InMemoryKv::default()),
            Arc::new(ChunkLockManager::new()),
            chunk_max,
            chunk_target,
        )
    }

    #[tokio::test]
    async fn round_trips_small_body() {
        let store = store(1_000_000, 100_000);
        let body = vec![7u8; 1234];
        let s = stream::iter(vec![Ok::<_, std::convert::Infallible>(Bytes::from(body.clone()))]);
        store.put("ci-1", s, metadata(0), Duration::from_secs(60)).await.unwrap();

        let artifact = store.get("ci-1").await.unwrap().unwrap();
        match artifact {
            StoredArtifact::Single { body: stored, metadata } => {
                assert_eq!(stored.as_ref(), body.as_slice());
                assert_eq!(metadata.total_length, 1234);
            }
            StoredArtifact::Chunked { .. } => panic!("expected single entry"),
        }
    }

    #[tokio::test]
    async fn chunks_large_body_and_reassembles() {
        let store = store(5_000_000, 1_000_000);
        let total = 3_500_000usize;
        let body: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let s = stream::iter(vec![Ok::<_, std::convert::Infallible>(Bytes::from(body.clone()))]);
        store.put("ci-2", s, metadata(0), Duration::from_secs(60)).await.unwrap();

        let artifact = store.get("ci-2").await.unwrap().unwrap();
        let manifest = match artifact {
            StoredArtifact::Chunked { manifest, .. } => manifest,
            StoredArtifact::Single { .. } => panic!("expected chunked entry"),
        };
        assert_eq!(manifest.chunk_count, 4);
        assert_eq!(manifest.per_chunk_lengths.iter().sum::<u64>(), total as u64);

        let mut reassembled = Vec::new();
        for i in 0..manifest.chunk_count {
            reassembled.extend_from_slice(&store.read_chunk(&manifest, i).await.unwrap());
        }
        assert_eq!(reassembled, body);
    }

    #[tokio::test]
    async fn lock_collision_is_abandoned_not_blocked() {
        let store = store(1_000_000, 100_000);
        assert!(store.locks.try_acquire("ci-3"));
        let s = stream::iter(vec![Ok::<_, std::convert::Infallible>(Bytes::from_static(b"x"))]);
        let err = store
            .put("ci-3", s, metadata(0), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockContended { .. }));
    }

    #[test]
    fn chunks_overlapping_locates_only_the_covering_window() {
        let manifest = Manifest {
            chunk_count: 4,
            chunk_size_target: 1_000_000,
            total_length: 3_500_000,
            chunk_keys: (0..4).map(|i| format!("ci::chunk::{i}")).collect(),
            per_chunk_lengths: vec![1_000_000, 1_000_000, 1_000_000, 500_000],
            metadata: metadata(3_500_000),
        };

        // A range entirely inside the last chunk must not pull chunks 0-2.
        let hits = manifest.chunks_overlapping(3_200_000, 3_400_000);
        assert_eq!(hits, vec![(3, 3_000_000)]);

        // A range spanning a chunk boundary picks up both chunks it touches.
        let hits = manifest.chunks_overlapping(1_500_000, 2_500_000);
        assert_eq!(hits, vec![(1, 1_000_000), (2, 2_000_000)]);
    }

    #[test]
    fn partial_responses_are_flagged() {
        let mut headers = http::HeaderMap::new();
        assert!(!is_partial_response(http::StatusCode::OK, &headers));
        headers.insert(http::header::CONTENT_RANGE, "bytes 0-10/100".parse().unwrap());
        assert!(is_partial_response(http::StatusCode::OK, &headers));
        assert!(is_partial_response(http::StatusCode::PARTIAL_CONTENT, &http::HeaderMap::new()));
    }
}
