//! VersionRegistry (C2): a per-key monotonically increasing counter used to
//! invalidate upstream caches by URL without deleting the artifact itself.
//!
//! The registry is never on the critical path — callers schedule [`VersionStore::store`]
//! as a background task — and tolerates concurrent writers by retrying with the
//! exponential backoff shared with [`crate::store`] (base 200ms, doubling, capped at
//! 2s, 3 attempts).

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::telemetry::{Event, EventSink};

/// A version record, as persisted in the version namespace (§6).
#[derive(Debug, Clone, Copy)]
pub struct VersionRecord {
    pub version: u64,
    pub updated_at_ms: u64,
    expires_at_ms: u64,
}

impl VersionRecord {
    /// Version records outlive artifacts so a re-created artifact continues the
    /// version sequence (§3); once the record itself expires, though, a read
    /// must treat the key as if no record had ever existed.
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Backend abstraction over the small key-value namespace the registry persists
/// into. Kept separate from [`crate::store::BlobStore`] per §6's "separate
/// namespace" design (§9's resolved open question).
#[async_trait::async_trait]
pub trait VersionBackend: Send + Sync {
    async fn read(&self, ci: &str) -> Result<Option<VersionRecord>, StoreError>;
    async fn write(&self, ci: &str, record: VersionRecord) -> Result<(), StoreError>;
}

/// An in-process version backend, suitable for single-node deployments and tests.
/// Production deployments supply a `VersionBackend` over their KV of choice.
#[derive(Default)]
pub struct InMemoryVersionBackend {
    table: Mutex<HashMap<String, VersionRecord>>,
}

#[async_trait::async_trait]
impl VersionBackend for InMemoryVersionBackend {
    async fn read(&self, ci: &str) -> Result<Option<VersionRecord>, StoreError> {
        Ok(self.table.lock().get(ci).copied())
    }

    async fn write(&self, ci: &str, record: VersionRecord) -> Result<(), StoreError> {
        self.table.lock().insert(ci.to_string(), record);
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The exponential backoff policy shared by C2 and C3: base 200ms, doubling,
/// capped at 2s, at most 3 attempts.
pub(crate) async fn retry_with_backoff<F, Fut, T>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    const BASE_MS: u64 = 200;
    const CAP_MS: u64 = 2_000;
    const MAX_ATTEMPTS: u32 = 3;

    let mut attempt = 0;
    let mut delay_ms = BASE_MS;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::RateLimitOrConflict(reason)) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(StoreError::RateLimitOrConflict(reason));
                }
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(CAP_MS);
            }
            Err(other) => return Err(other),
        }
    }
}

/// The VersionRegistry itself: `get`, `next`, `store` over a [`VersionBackend`].
pub struct VersionRegistry {
    backend: Arc<dyn VersionBackend>,
    sink: Arc<dyn EventSink>,
}

impl VersionRegistry {
    pub fn new(backend: Arc<dyn VersionBackend>, sink: Arc<dyn EventSink>) -> Self {
        Self { backend, sink }
    }

    /// `get(CI) → version | absent`. Absence is version 0 downstream (§3's VR
    /// invariant), represented here as `None`. A record past its own retention
    /// (`expires_at_ms`) reads back as absent.
    pub async fn get(&self, ci: &str) -> Option<u64> {
        let record = self.backend.read(ci).await.ok().flatten()?;
        (!record.is_expired(now_ms())).then_some(record.version)
    }

    /// `next(CI, force) → new_version`. Logs — never throws — on rate-limit or
    /// conflict signals from the backend; every write retries per the shared
    /// backoff policy.
    ///
    /// An expired record reads back as absent, same as `get`. With no live
    /// record, `force` skips straight to version 2 rather than 1 — so a caller
    /// forcing an invalidation (e.g. an explicit purge) always gets a version
    /// that actually propagates as a `v=` parameter (§4.2: only `v >= 2` is
    /// ever emitted), even on a key that was never versioned before.
    pub async fn next(&self, ci: &str, force: bool) -> u64 {
        let existing = self
            .backend
            .read(ci)
            .await
            .ok()
            .flatten()
            .filter(|record| !record.is_expired(now_ms()));
        match existing {
            Some(record) => record.version + 1,
            None if force => 2,
            None => 1,
        }
    }

    /// `store(CI, version, ttl)`: upsert, retried with backoff. `ttl` is the
    /// record's own retention, typically `2x` the artifact TTL (§3).
    pub async fn store(&self, ci: &str, version: u64, ttl: Duration) {
        let record = VersionRecord {
            version,
            updated_at_ms: now_ms(),
            expires_at_ms: now_ms() + ttl.as_millis() as u64,
        };
        let backend = self.backend.clone();
        let ci_owned = ci.to_string();
        let result = retry_with_backoff(|| {
            let backend = backend.clone();
            let ci = ci_owned.clone();
            async move { backend.write(&ci, record).await }
        })
        .await;

        match result {
            Ok(()) => self.sink.event(Event::VersionBumped { ci, version }),
            Err(err) => self.sink.event(Event::StoreWriteFailed {
                ci,
                reason: &err.to_string(),
            }),
        }
    }
}

/// Version propagation rule (§4.2): only versions `>= 2` are emitted as `v=` on
/// the upstream transform URL, to avoid noisy URLs on first-ever requests.
pub fn propagated_version(version: u64) -> Option<u64> {
    (version >= 2).then_some(version)
}
