//! Production HTTP implementations of the collaborator interfaces (§9, §10.5).
//!
//! Generalized from the teacher crate's `TakoClient`/`TakoTlsClient`: same
//! `hyper` connection-handling idiom, but built on `hyper_util`'s managed legacy
//! client (connection pooling, keep-alive, automatic redial) instead of a single
//! hand-rolled long-lived connection, and streaming response bodies straight
//! through rather than buffering them into a `Vec<u8>` — the core never needs a
//! fully materialized upstream body (§5). No TLS: every deployment this engine
//! targets puts a terminating proxy in front of the transformer/origin
//! collaborators, so these clients speak plain HTTP/1.1 only.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt as _;
use http::{HeaderMap, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::collaborators::{
    BoxByteStream, OriginFetcher, StorageOrigin, Transformer, TransformRequest, UpstreamResponse,
};
use crate::error::{OriginError, UpstreamError};

type LegacyClient = Client<HttpConnector, Empty<Bytes>>;

fn new_legacy_client() -> LegacyClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Reads a bounded amount of an error response body for classification, without
/// materializing arbitrarily large bodies just to build an error message.
const ERROR_BODY_SAMPLE_LIMIT: usize = 4096;

async fn sample_body(body: hyper::body::Incoming) -> String {
    let collected = http_body_util::Limited::new(body, ERROR_BODY_SAMPLE_LIMIT)
        .collect()
        .await;
    match collected {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(_) => String::new(),
    }
}

fn streaming_body(body: hyper::body::Incoming) -> BoxByteStream {
    Box::pin(
        body.into_data_stream()
            .map(|result| result.map_err(std::io::Error::other)),
    )
}

/// Classifies a non-2xx upstream transform response into the [`UpstreamError`]
/// variant the rest of the engine branches on (§9's "Work" simplification —
/// classification happens here, once, at the collaborator boundary).
async fn classify_transform_error(status: StatusCode, body: hyper::body::Incoming) -> UpstreamError {
    let message = sample_body(body).await;
    classify_from_message(status, message)
}

/// The pure classification rule behind [`classify_transform_error`], split out
/// so it's testable without needing a real `hyper::body::Incoming`.
fn classify_from_message(status: StatusCode, message: String) -> UpstreamError {
    if status == StatusCode::BAD_REQUEST && message.contains("duration must be between") {
        return UpstreamError::Duration { message };
    }
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        if message.to_ascii_lowercase().contains("256") {
            return UpstreamError::TooLarge256MiB { message };
        }
        return UpstreamError::FileSize { message };
    }
    if status.is_server_error() {
        return UpstreamError::Server { status, message };
    }
    UpstreamError::OtherClient { status, message }
}

/// Issues the upstream media-transformation fetch over plain HTTP (§1, §10.5).
pub struct HttpTransformer {
    client: LegacyClient,
    timeout: Duration,
}

impl HttpTransformer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: new_legacy_client(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Transformer for HttpTransformer {
    async fn transform(&self, request: &TransformRequest) -> Result<UpstreamResponse, UpstreamError> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|e: http::uri::InvalidUri| UpstreamError::Transport(e.to_string()))?;
        let req = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.into_body();

        if !status.is_success() {
            return Err(classify_transform_error(status, body).await);
        }

        Ok(UpstreamResponse {
            status,
            headers,
            content_length,
            body: streaming_body(body),
        })
    }
}

/// Fetches source bytes directly from the origin that owns a path, bypassing
/// the transformation collaborator (fallback step 2, §4.8).
pub struct HttpOriginFetcher {
    client: LegacyClient,
    base_url: String,
}

impl HttpOriginFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: new_legacy_client(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl OriginFetcher for HttpOriginFetcher {
    async fn fetch(&self, source_path: &str, passthrough_headers: &HeaderMap) -> Result<UpstreamResponse, OriginError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), source_path.trim_start_matches('/'));
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| OriginError::Fetch(e.to_string()))?;

        let mut builder = hyper::Request::builder().method(hyper::Method::GET).uri(uri);
        for (name, value) in passthrough_headers {
            builder = builder.header(name.clone(), value.clone());
        }
        let req = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| OriginError::Fetch(e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|_| OriginError::Unavailable)?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(OriginError::Status { status });
        }

        let headers = response.headers().clone();
        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.into_body();

        Ok(UpstreamResponse {
            status,
            headers,
            content_length,
            body: streaming_body(body),
        })
    }
}

/// Fetches source bytes from a storage-service origin, the last fallback step
/// before the terminal error response (fallback step 3, §4.8).
pub struct HttpStorageOrigin {
    client: LegacyClient,
    base_url: String,
}

impl HttpStorageOrigin {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: new_legacy_client(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl StorageOrigin for HttpStorageOrigin {
    async fn fetch(&self, source_path: &str) -> Result<UpstreamResponse, OriginError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), source_path.trim_start_matches('/'));
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| OriginError::Fetch(e.to_string()))?;

        let req = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| OriginError::Fetch(e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|_| OriginError::Unavailable)?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(OriginError::Status { status });
        }

        let headers = response.headers().clone();
        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response.into_body();

        Ok(UpstreamResponse {
            status,
            headers,
            content_length,
            body: streaming_body(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_duration_error() {
        let err = classify_from_message(
            StatusCode::BAD_REQUEST,
            "duration must be between 1s and 10s.".to_string(),
        );
        assert!(matches!(err, UpstreamError::Duration { .. }));
    }

    #[test]
    fn classifies_256mib_error() {
        let err = classify_from_message(
            StatusCode::PAYLOAD_TOO_LARGE,
            "video exceeds the 256MiB processing limit".to_string(),
        );
        assert!(matches!(err, UpstreamError::TooLarge256MiB { .. }));
    }

    #[test]
    fn classifies_plain_file_size_error() {
        let err = classify_from_message(StatusCode::PAYLOAD_TOO_LARGE, "file too large".to_string());
        assert!(matches!(err, UpstreamError::FileSize { .. }));
    }

    #[test]
    fn classifies_server_error() {
        let err = classify_from_message(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string());
        assert!(matches!(err, UpstreamError::Server { .. }));
    }

    #[test]
    fn classifies_other_client_error() {
        let err = classify_from_message(StatusCode::FORBIDDEN, "forbidden".to_string());
        assert!(matches!(err, UpstreamError::OtherClient { .. }));
    }
}
