//! TtlRefresher (C5): opportunistic, rate-limited TTL extension on cache hits.
//!
//! Refresh is always scheduled on the background execution handle (§5, §9's
//! "global singletons" resolution keeps no ambient task spawner — the orchestrator
//! passes one in explicitly via [`crate::context::RequestContext`]) so the
//! user-visible response never waits on it, and failures are logged and swallowed.

use std::{sync::Arc, time::Duration};

use crate::primitives::BoundedLru;
use crate::store::{ArtifactMetadata, ChunkedBlobStore};
use crate::telemetry::{Event, EventSink};

/// TTL-refresh thresholds (§4.5's decision rule).
#[derive(Debug, Clone, Copy)]
pub struct RefreshThresholds {
    pub min_elapsed_pct: f64,
    pub min_remaining_seconds: i64,
}

/// Decides whether an artifact is due for a TTL refresh and, if so, schedules a
/// metadata-only rewrite in the background.
pub struct TtlRefresher {
    thresholds: RefreshThresholds,
    cooldown: BoundedLru<String, ()>,
    sink: Arc<dyn EventSink>,
}

impl TtlRefresher {
    pub fn new(thresholds: RefreshThresholds, cooldown_window: Duration, sink: Arc<dyn EventSink>) -> Self {
        Self {
            thresholds,
            cooldown: BoundedLru::new(10_000, cooldown_window),
            sink,
        }
    }

    /// `elapsed / original_ttl >= min_elapsed_pct AND remaining >= min_remaining_seconds`
    /// (§4.5). `now_ms`, `created_at_ms`, and `expires_at_ms` all come from the
    /// artifact's own metadata so this is a pure function of the hit's timing.
    pub fn should_refresh(&self, metadata: &ArtifactMetadata, now_ms: u64) -> bool {
        let total_ttl_ms = metadata.expires_at_ms.saturating_sub(metadata.created_at_ms);
        if total_ttl_ms == 0 {
            return false;
        }
        let elapsed_ms = now_ms.saturating_sub(metadata.created_at_ms);
        let remaining_s = metadata.expires_at_ms.saturating_sub(now_ms) as i64 / 1000;
        let elapsed_pct = elapsed_ms as f64 / total_ttl_ms as f64;
        elapsed_pct >= self.thresholds.min_elapsed_pct && remaining_s >= self.thresholds.min_remaining_seconds
    }

    /// Attempts a refresh for `ci` unless a prior refresh is still within its
    /// cooldown window (§4.5: "to avoid thundering herd, a per-key refresh cooldown
    /// ... is enforced via the coalescer's shared LRU"). Intended to be spawned on
    /// the background execution handle by the caller — never awaited inline on the
    /// request path.
    pub async fn refresh(&self, store: &ChunkedBlobStore, ci: &str, metadata: &ArtifactMetadata, new_ttl: Duration) {
        if self.cooldown.get(&ci.to_string()).is_some() {
            self.sink.event(Event::RefreshSkipped {
                ci,
                reason: "cooldown",
            });
            return;
        }
        self.cooldown.set(ci.to_string(), ());
        self.sink.event(Event::RefreshAttempted { ci });

        match store.refresh_ttl(ci, metadata, new_ttl).await {
            Ok(true) => {}
            Ok(false) => self.sink.event(Event::RefreshSkipped {
                ci,
                reason: "store does not support metadata-only rewrite",
            }),
            Err(err) => self.sink.event(Event::RefreshSkipped {
                ci,
                reason: &err.to_string(),
            }),
        }
    }
}
