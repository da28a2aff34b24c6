//! `RequestContext` (§9's resolution of "duck-typed context objects"): the one
//! record passed explicitly through the orchestrator carrying the background
//! execution handle and the structured-event sink. The bounded-LRU handles
//! mentioned alongside it in §9 live on the long-lived components that own them
//! (the coalescer's in-flight table, the refresher's cooldown map, the chunk-lock
//! manager) rather than being threaded per-request, since those are constructed
//! once at startup and shared across every request.

use std::{future::Future, sync::Arc};

use crate::telemetry::EventSink;

/// Carries everything a single request needs that isn't already owned by the
/// long-lived orchestrator components.
#[derive(Clone)]
pub struct RequestContext {
    sink: Arc<dyn EventSink>,
}

impl RequestContext {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Enqueues `fut` on the background execution handle (§5: "Background tasks
    /// MUST be enqueued via the host's background execution handle ... never
    /// fire-and-forget"). A thin wrapper over `tokio::spawn` today; kept as a
    /// named seam so a deployment embedding this engine in a different runtime
    /// can swap the executor without touching call sites.
    pub fn spawn_background<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut);
    }
}
