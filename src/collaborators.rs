//! Interfaces for the engine's three external collaborators (§9's resolution of
//! "dynamic imports to break cyclic dependencies"): the upstream media transformer,
//! a direct origin fetcher, and a storage-service origin. The core depends only on
//! these trait signatures; it never imports or constructs a concrete HTTP client
//! itself. Production implementations are composed at startup (see [`crate::client`]).

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::Stream;
use http::{HeaderMap, StatusCode};

use crate::error::{OriginError, UpstreamError};

/// A fully-buffered or streaming collaborator response. The core never needs
/// random access into the body before it decides whether to cache it — it only
/// ever forwards the stream onward (through [`crate::store::ChunkedBlobStore::put`]
/// and/or the client response) — so collaborators return a boxed byte stream
/// rather than a materialized buffer.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub body: BoxByteStream,
}

pub type BoxByteStream =
    std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// A transform request: the fully-constructed upstream URL plus any headers that
/// should ride along unmodified (e.g. `If-None-Match` is intentionally NOT
/// forwarded here — §6 only passes those through on the fallback's direct-origin
/// path).
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub url: String,
    pub params: HashMap<String, String>,
}

/// Issues the upstream media-transformation fetch (§1's "out of scope" collaborator,
/// §10.5).
#[async_trait::async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, request: &TransformRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// Fetches the source bytes directly from the origin that owns `source_path`,
/// bypassing the transformation collaborator entirely. Used by fallback step 2.
#[async_trait::async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(
        &self,
        source_path: &str,
        passthrough_headers: &HeaderMap,
    ) -> Result<UpstreamResponse, OriginError>;
}

/// Fetches the source bytes from a storage-service origin (a different
/// collaborator than [`OriginFetcher`], consulted as the last fallback step
/// before the terminal error response).
#[async_trait::async_trait]
pub trait StorageOrigin: Send + Sync {
    async fn fetch(&self, source_path: &str) -> Result<UpstreamResponse, OriginError>;
}
