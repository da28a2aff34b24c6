//! An edge-deployed cache and range-streaming engine for on-demand media
//! transformation proxies.
//!
//! The engine sits in front of an upstream media-transformation service and a
//! handful of origin collaborators (interfaces only — the core never depends on
//! a concrete HTTP client): it derives a deterministic cache identity from a
//! request, coalesces concurrent cache misses into a single upstream fetch,
//! stores the result in a blob store that caps per-entry size (transparently
//! chunking anything larger), serves arbitrary byte ranges without ever
//! materializing a full object in memory, and falls back through an ordered
//! recovery chain when the transformer or an origin fails.
//!
//! # Module map
//! - [key] — C1, deterministic cache identity derivation
//! - [version] — C2, per-key version counter for upstream cache-busting
//! - [store] — C3, the chunked blob store (manifest + ordered chunk entries)
//! - [range] — C4, `Range` header parsing and chunk-aware byte-window streaming
//! - [refresher] — C5, opportunistic TTL refresh on cache hits
//! - [coalescer] — C6, single-flight request coalescing
//! - [orchestrator] — C7, the top-level request state machine
//! - [fallback] — C8, the ordered recovery pipeline
//! - [primitives] — C9, the bounded LRU and concurrency gate shared by the above
//! - [collaborators] — trait interfaces for the transformer/origin collaborators
//! - [client] — production HTTP implementations of those interfaces
//! - [config] — environment-driven runtime configuration
//! - [context] — per-request background-task and event-sink handle
//! - [error] — the crate's error taxonomy
//! - [telemetry] — structured-event sink, forwarding to `tracing`
//! - [body] — streaming body wrapper and the stream-tee primitive
//! - [types] — shared request/response/body type aliases

/// Streaming HTTP body wrapper and the stream-tee primitive.
pub mod body;

/// Production HTTP implementations of the collaborator interfaces.
pub mod client;

/// RequestCoalescer (C6): single-flight map keyed by cache identity.
pub mod coalescer;

/// Interfaces for the transformer/origin collaborators.
pub mod collaborators;

/// Environment-driven runtime configuration.
pub mod config;

/// Per-request background-task handle and event-sink access.
pub mod context;

/// The crate's error taxonomy.
pub mod error;

/// FallbackPipeline (C8): ordered recovery when the transformer fails.
pub mod fallback;

/// KeyDeriver (C1): deterministic cache identity derivation.
pub mod key;

/// CacheOrchestrator (C7): the top-level request state machine.
pub mod orchestrator;

/// Shared primitives (C9): bounded LRU-with-TTL map and concurrency gate.
pub mod primitives;

/// RangeSlicer (C4): `Range` header parsing and chunk-aware streaming.
pub mod range;

/// TtlRefresher (C5): opportunistic TTL refresh on cache hits.
pub mod refresher;

/// HTTP server loop wiring requests into a [`CacheOrchestrator`].
mod server;

/// ChunkedBlobStore (C3): blob storage with transparent chunking.
pub mod store;

/// Structured-event sink, forwarding to `tracing`.
pub mod telemetry;

/// Shared request/response/body type aliases.
pub mod types;

/// VersionRegistry (C2): per-key version counter.
pub mod version;

pub use orchestrator::CacheOrchestrator;
pub use server::serve;
