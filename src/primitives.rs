//! Shared primitives (C9): a bounded LRU-with-TTL map and a concurrency gate.
//!
//! Every piece of shared mutable state in the engine — the coalescer's in-flight
//! table, the refresh cooldown cache, the chunk-lock manager — is an instance of
//! [`BoundedLru`]; per §9, unbounded maps are a defect, not an oversight to fix later.

use std::{
    collections::HashMap,
    hash::Hash,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    // Insertion order for LRU eviction; older entries sort first when reclaiming.
    seq: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    capacity: usize,
    ttl: Duration,
    next_seq: u64,
}

/// A bounded map with TTL-based and capacity-based eviction.
///
/// `set` evicts expired entries first and, if still at capacity, evicts the
/// oldest remaining entry (§4.9). All operations are synchronous and guarded by
/// a single lock, which is appropriate given the map only ever holds cheap
/// metadata (never response bodies themselves).
pub struct BoundedLru<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> BoundedLru<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                capacity,
                ttl,
                next_seq: 0,
            }),
        }
    }

    /// Inserts or replaces `k -> v`, evicting expired and (if at capacity) the
    /// oldest entry first.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let ttl = inner.ttl;
        let now = Instant::now();
        inner.map.retain(|_, e| now.duration_since(e.inserted_at) < ttl);

        if inner.map.len() >= inner.capacity && !inner.map.contains_key(&key) {
            if let Some(oldest_key) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest_key);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.map.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                seq,
            },
        );
    }

    /// Removes `key` unconditionally, returning its value if present and live.
    pub fn remove(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let mut inner = self.inner.lock();
        inner.map.remove(key).map(|e| e.value)
    }

    /// Current entry count, after evicting anything expired. Used by tests to
    /// assert the `coalesce.max_entries` bound (§8 invariant 10).
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        let ttl = inner.ttl;
        let now = Instant::now();
        inner.map.retain(|_, e| now.duration_since(e.inserted_at) < ttl);
        inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> BoundedLru<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Looks up `key`, evicting it (and returning `None`) if its TTL has elapsed.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let ttl = inner.ttl;
        let now = Instant::now();
        if let Some(entry) = inner.map.get(key) {
            if now.duration_since(entry.inserted_at) >= ttl {
                inner.map.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }
}

/// A counted semaphore with a soft start-permit budget and a hard queue-depth
/// ceiling. Requests beyond `hard_limit` fail fast with backpressure rather than
/// queuing indefinitely, surfacing to the orchestrator as a retryable fallback
/// trigger (§4.9, §7's `ConcurrencyError`).
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    hard_limit: usize,
    queued: std::sync::atomic::AtomicUsize,
}

/// A held permit; dropping it releases the slot back to the gate.
pub struct GatePermit<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
    gate: &'a ConcurrencyGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate
            .queued
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }
}

impl ConcurrencyGate {
    pub fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            semaphore: Semaphore::new(soft_limit),
            hard_limit,
            queued: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Acquires a permit, queuing behind the soft limit. Returns
    /// `Err(GateError::Backpressure)` immediately if queue depth already exceeds
    /// `hard_limit`, without ever blocking the caller.
    pub async fn acquire(&self) -> Result<GatePermit<'_>, GateError> {
        let depth = self.queued.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1;
        if depth > self.hard_limit {
            self.queued.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
            return Err(GateError::Backpressure);
        }
        match self.semaphore.acquire().await {
            Ok(permit) => Ok(GatePermit {
                _permit: permit,
                gate: self,
            }),
            Err(_) => {
                self.queued.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                Err(GateError::Closed)
            }
        }
    }

    /// Non-blocking variant: fails immediately (rather than queuing) if no
    /// permit is immediately available.
    pub fn try_acquire(&self) -> Result<GatePermit<'_>, GateError> {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                self.queued.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                Ok(GatePermit {
                    _permit: permit,
                    gate: self,
                })
            }
            Err(TryAcquireError::NoPermits) => Err(GateError::Backpressure),
            Err(TryAcquireError::Closed) => Err(GateError::Closed),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("concurrency gate: hard limit exceeded")]
    Backpressure,
    #[error("concurrency gate closed")]
    Closed,
}
