//! Structured-event sink (§9's "duck-typed context objects" resolution).
//!
//! The engine never prints or logs directly; every significant occurrence is
//! reported through an injected [`EventSink`]. The default production sink forwards
//! to [`tracing`]; tests use [`NullSink`] so they don't need a global subscriber.

use std::fmt;

use http::StatusCode;

/// A significant occurrence inside the cache engine, reported to the sink.
#[derive(Debug, Clone)]
pub enum Event<'a> {
    CacheHit { ci: &'a str },
    CacheMiss { ci: &'a str },
    CoalesceOwner { ci: &'a str },
    CoalesceWaiter { ci: &'a str },
    CoalesceWaitTimeout { ci: &'a str, waited_ms: u64 },
    StoreReadFailed { ci: &'a str, reason: &'a str },
    StoreWriteFailed { ci: &'a str, reason: &'a str },
    VersionBumped { ci: &'a str, version: u64 },
    RefreshAttempted { ci: &'a str },
    RefreshSkipped { ci: &'a str, reason: &'a str },
    FallbackEntered { ci: &'a str, step: &'a str, reason: &'a str },
    FallbackTerminal { ci: &'a str, status: StatusCode },
}

/// Receives [`Event`]s from the engine. Implementations must not block; the
/// orchestrator calls this inline on the request's task.
pub trait EventSink: fmt::Debug + Send + Sync {
    fn event(&self, event: Event<'_>);
}

/// Forwards every [`Event`] to `tracing` as a structured field set rather than an
/// interpolated string, so events remain queryable by CI, step, or status.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn event(&self, event: Event<'_>) {
        match event {
            Event::CacheHit { ci } => tracing::debug!(ci, "cache hit"),
            Event::CacheMiss { ci } => tracing::debug!(ci, "cache miss"),
            Event::CoalesceOwner { ci } => tracing::trace!(ci, "coalesce: became owner"),
            Event::CoalesceWaiter { ci } => tracing::trace!(ci, "coalesce: became waiter"),
            Event::CoalesceWaitTimeout { ci, waited_ms } => {
                tracing::warn!(ci, waited_ms, "coalesce: waiter timed out")
            }
            Event::StoreReadFailed { ci, reason } => {
                tracing::warn!(ci, reason, "store read failed, treating as miss")
            }
            Event::StoreWriteFailed { ci, reason } => {
                tracing::warn!(ci, reason, "store write failed")
            }
            Event::VersionBumped { ci, version } => {
                tracing::debug!(ci, version, "version bumped")
            }
            Event::RefreshAttempted { ci } => tracing::trace!(ci, "ttl refresh attempted"),
            Event::RefreshSkipped { ci, reason } => {
                tracing::trace!(ci, reason, "ttl refresh skipped")
            }
            Event::FallbackEntered { ci, step, reason } => {
                tracing::info!(ci, step, reason, "fallback step entered")
            }
            Event::FallbackTerminal { ci, status } => {
                tracing::error!(ci, status = status.as_u16(), "fallback exhausted")
            }
        }
    }
}

/// A no-op sink for tests and for binaries that opt out of tracing entirely.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _event: Event<'_>) {}
}

/// Initializes the process-wide `tracing` subscriber. Gated behind the
/// `tracing-subscriber` feature, mirroring the teacher crate's opt-in
/// `tako-tracing` convention — a binary that wants structured log output on
/// stdout calls this once at startup; libraries embedding the engine are free to
/// install their own subscriber instead.
#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
