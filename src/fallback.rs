//! FallbackPipeline (C8): the ordered recovery chain entered whenever the upstream
//! transformer returns a non-2xx (§4.8). Each step short-circuits on success; every
//! response this pipeline produces carries the `X-Fallback-*` diagnostic headers.

use std::{sync::Arc, time::Duration};

use http::{HeaderMap, HeaderValue, StatusCode, header::HeaderName};

use crate::body::{CacheBody, Tee};
use crate::collaborators::{OriginFetcher, StorageOrigin, Transformer, TransformRequest, UpstreamResponse};
use crate::config::Config;
use crate::error::{CoreError, UpstreamError};
use crate::primitives::BoundedLru;
use crate::store::{is_partial_response, ArtifactMetadata, ChunkedBlobStore};
use crate::telemetry::{Event, EventSink};
use crate::types::Response;

const X_FALLBACK_APPLIED: &str = "x-fallback-applied";
const X_FALLBACK_REASON: &str = "x-fallback-reason";
const X_ORIGINAL_ERROR_STATUS: &str = "x-original-error-status";
const X_FALLBACK_FAILED: &str = "x-fallback-failed";
const X_VIDEO_EXCEEDS_256MIB: &str = "x-video-exceeds-256mib";
const X_DURATION_ADJUSTED: &str = "x-duration-adjusted";
const X_ORIGINAL_DURATION: &str = "x-original-duration";
const X_ADJUSTED_DURATION: &str = "x-adjusted-duration";

/// Process-wide registry of observed per-source duration ceilings, populated by
/// step 1's duration-adjust retry "for future pre-emptive clamping" (§4.8).
pub struct DurationLimitRegistry {
    observed: BoundedLru<String, u64>,
}

impl DurationLimitRegistry {
    pub fn new() -> Self {
        Self {
            observed: BoundedLru::new(10_000, Duration::from_secs(24 * 3600)),
        }
    }

    pub fn observe(&self, source_path: &str, max_seconds: u64) {
        self.observed.set(source_path.to_string(), max_seconds);
    }

    pub fn get(&self, source_path: &str) -> Option<u64> {
        self.observed.get(&source_path.to_string())
    }
}

impl Default for DurationLimitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses an upstream "duration must be between Xs and Ys" error body, returning
/// the ceiling value and its unit suffix (e.g. `(10, "s")`). Returns `None` if the
/// message doesn't match that shape; callers treat that as "not a duration error
/// we can retry".
pub fn parse_duration_ceiling(message: &str) -> Option<(u64, String)> {
    let and_idx = message.rfind(" and ")?;
    let tail = message[and_idx + 5..].trim().trim_end_matches('.');
    let unit_start = tail.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    if unit_start == 0 {
        return None;
    }
    let (num_str, unit) = tail.split_at(unit_start);
    let value: f64 = num_str.parse().ok()?;
    if unit.is_empty() {
        return None;
    }
    Some((value.floor() as u64, unit.to_string()))
}

/// Everything the pipeline needs to attempt recovery, gathered by the orchestrator
/// before entering `Fallback` (§4.7 transition 9).
pub struct FallbackInput<'a> {
    pub ci: &'a str,
    pub source_path: &'a str,
    pub original_request: TransformRequest,
    pub error: UpstreamError,
    pub passthrough_headers: HeaderMap,
    pub direct_origin_url: Option<String>,
}

pub struct FallbackPipeline {
    config: Arc<Config>,
    transformer: Arc<dyn Transformer>,
    origin: Option<Arc<dyn OriginFetcher>>,
    storage_origin: Option<Arc<dyn StorageOrigin>>,
    store: Arc<ChunkedBlobStore>,
    duration_limits: Arc<DurationLimitRegistry>,
    sink: Arc<dyn EventSink>,
}

impl FallbackPipeline {
    pub fn new(
        config: Arc<Config>,
        transformer: Arc<dyn Transformer>,
        origin: Option<Arc<dyn OriginFetcher>>,
        storage_origin: Option<Arc<dyn StorageOrigin>>,
        store: Arc<ChunkedBlobStore>,
        duration_limits: Arc<DurationLimitRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            transformer,
            origin,
            storage_origin,
            store,
            duration_limits,
            sink,
        }
    }

    /// Runs the recovery chain for `input`, returning the response to send to the
    /// client. Never returns `Err` — the terminal step always synthesizes a
    /// response, per §4.8 step 4 and §7's "terminal fallback synthesizes a
    /// structured error response".
    pub async fn run(&self, input: FallbackInput<'_>) -> Response {
        let original_status = error_status(&input.error);

        if let Some(resp) = self.try_duration_retry(&input).await {
            return resp;
        }
        if let Some(resp) = self.try_direct_origin(&input, original_status).await {
            return resp;
        }
        if let Some(resp) = self.try_storage_origin(&input, original_status).await {
            return resp;
        }
        self.terminal(&input, original_status)
    }

    async fn try_duration_retry(&self, input: &FallbackInput<'_>) -> Option<Response> {
        let UpstreamError::Duration { message } = &input.error else {
            return None;
        };
        let (ceiling, unit) = parse_duration_ceiling(message)?;
        let original_duration = input.original_request.params.get("duration").cloned();
        self.duration_limits.observe(input.source_path, ceiling);

        let mut retried = input.original_request.clone();
        let adjusted = format!("{ceiling}{unit}");
        retried.params.insert("duration".to_string(), adjusted.clone());

        self.sink.event(Event::FallbackEntered {
            ci: input.ci,
            step: "duration_retry",
            reason: message,
        });

        match self.transformer.transform(&retried).await {
            Ok(upstream) => {
                let partial = is_partial_response(upstream.status, &upstream.headers);
                let ttl = Duration::from_secs(self.config.ttl_for_status(upstream.status).max(0) as u64);
                let mut response = self.forward_maybe_store(input.ci, upstream, !partial, ttl).await;
                apply_fallback_headers(&mut response, "duration_retry", original_status_of(&input.error));
                if let Some(original) = original_duration {
                    set_header(&mut response, X_ORIGINAL_DURATION, &original);
                }
                set_header(&mut response, X_ADJUSTED_DURATION, &adjusted);
                set_header(&mut response, X_DURATION_ADJUSTED, "true");
                Some(response)
            }
            Err(_) => None,
        }
    }

    async fn try_direct_origin(&self, input: &FallbackInput<'_>, original_status: StatusCode) -> Option<Response> {
        let origin = self.origin.as_ref()?;
        let eligible = matches!(
            input.error,
            UpstreamError::Server { .. } | UpstreamError::FileSize { .. } | UpstreamError::TooLarge256MiB { .. }
        );
        if !eligible || original_status == StatusCode::NOT_FOUND {
            return None;
        }

        self.sink.event(Event::FallbackEntered {
            ci: input.ci,
            step: "direct_origin",
            reason: &input.error.to_string(),
        });

        let fetched = origin
            .fetch(input.source_path, &input.passthrough_headers)
            .await
            .ok()?;

        let is_256mib = matches!(input.error, UpstreamError::TooLarge256MiB { .. });
        let is_file_size = matches!(input.error, UpstreamError::FileSize { .. });
        let partial = is_partial_response(fetched.status, &fetched.headers);

        let should_store = !is_file_size && !partial;
        let ttl = Duration::from_secs(self.config.ttl_for_status(fetched.status).max(0) as u64);
        let mut response = self.forward_maybe_store(input.ci, fetched, should_store, ttl).await;

        apply_fallback_headers(&mut response, "direct_origin", original_status);
        if is_256mib {
            set_header(&mut response, X_VIDEO_EXCEEDS_256MIB, "true");
            response
                .headers_mut()
                .insert(http::header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=3600"));
        }
        Some(response)
    }

    async fn try_storage_origin(&self, input: &FallbackInput<'_>, original_status: StatusCode) -> Option<Response> {
        let storage = self.storage_origin.as_ref()?;
        self.sink.event(Event::FallbackEntered {
            ci: input.ci,
            step: "storage_origin",
            reason: &input.error.to_string(),
        });
        let fetched = storage.fetch(input.source_path).await.ok()?;
        let partial = is_partial_response(fetched.status, &fetched.headers);
        let ttl = Duration::from_secs(self.config.ttl_for_status(fetched.status).max(0) as u64);
        let mut response = self.forward_maybe_store(input.ci, fetched, !partial, ttl).await;
        apply_fallback_headers(&mut response, "storage_origin", original_status);
        Some(response)
    }

    fn terminal(&self, input: &FallbackInput<'_>, original_status: StatusCode) -> Response {
        self.sink.event(Event::FallbackTerminal {
            ci: input.ci,
            status: original_status,
        });
        let core_err: CoreError = clone_as_core_error(&input.error);
        let body = core_err.body();
        let mut response = hyper::Response::builder()
            .status(core_err.status())
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(CacheBody::from(serde_json::to_vec(&body).unwrap_or_default()))
            .expect("static error response is always valid");
        apply_fallback_headers(&mut response, "terminal", original_status);
        set_header(&mut response, X_FALLBACK_FAILED, "true");
        response
    }

    /// Streams `upstream` to the client, optionally backgrounding a store write.
    /// When storing, the upstream stream is fanned out through a [`Tee`] — one
    /// subscriber feeds [`ChunkedBlobStore::put`] in the background, the other
    /// rides straight through to the client — so neither path buffers the body.
    async fn forward_maybe_store(
        &self,
        ci: &str,
        upstream: UpstreamResponse,
        should_store: bool,
        ttl: Duration,
    ) -> Response {
        use futures_util::StreamExt;
        use http_body_util::BodyExt;

        let content_type = upstream
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let status = upstream.status;
        let content_length = upstream.content_length;
        // §4.8: "streamed with Accept-Ranges: bytes preserved when the origin
        // supports it" — forward the origin's own Accept-Ranges rather than
        // asserting one the origin never advertised.
        let accept_ranges = upstream.headers.get(http::header::ACCEPT_RANGES).cloned();

        if should_store {
            let tee = Tee::new(64);
            let mut upstream_body = upstream.body;
            let feeder = tee.clone();
            tokio::spawn(async move {
                while let Some(next) = upstream_body.next().await {
                    match next {
                        Ok(chunk) => feeder.feed(chunk),
                        Err(err) => {
                            feeder.fail(err.to_string());
                            return;
                        }
                    }
                }
                feeder.finish();
            });

            let store = self.store.clone();
            let ci_owned = ci.to_string();
            let store_content_type = content_type.clone();
            let store_stream = tee.subscribe().into_data_stream();
            let metadata = ArtifactMetadata {
                source_path: ci_owned.clone(),
                mode: "video".into(),
                derivative: None,
                width: None,
                height: None,
                content_type: store_content_type,
                total_length: 0,
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
                extensions: Default::default(),
            };
            tokio::spawn(async move {
                let _ = store.put(&ci_owned, store_stream, metadata, ttl).await;
            });

            let mut builder = hyper::Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, content_type);
            if let Some(len) = content_length {
                builder = builder.header(http::header::CONTENT_LENGTH, len);
            }
            if let Some(accept_ranges) = &accept_ranges {
                builder = builder.header(http::header::ACCEPT_RANGES, accept_ranges.clone());
            }
            builder
                .body(tee.subscribe())
                .expect("fallback response headers are always valid")
        } else {
            let mut builder = hyper::Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, content_type);
            if let Some(len) = content_length {
                builder = builder.header(http::header::CONTENT_LENGTH, len);
            }
            if let Some(accept_ranges) = &accept_ranges {
                builder = builder.header(http::header::ACCEPT_RANGES, accept_ranges.clone());
            }
            builder
                .body(CacheBody::from_stream(upstream.body))
                .expect("fallback response headers are always valid")
        }
    }

}

fn error_status(err: &UpstreamError) -> StatusCode {
    match err {
        UpstreamError::Duration { .. } => StatusCode::BAD_REQUEST,
        UpstreamError::FileSize { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UpstreamError::TooLarge256MiB { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UpstreamError::Server { status, .. } => *status,
        UpstreamError::OtherClient { status, .. } => *status,
        UpstreamError::Transport(_) => StatusCode::BAD_GATEWAY,
        UpstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn original_status_of(err: &UpstreamError) -> StatusCode {
    error_status(err)
}

fn clone_as_core_error(err: &UpstreamError) -> CoreError {
    let cloned = match err {
        UpstreamError::Duration { message } => UpstreamError::Duration { message: message.clone() },
        UpstreamError::FileSize { message } => UpstreamError::FileSize { message: message.clone() },
        UpstreamError::TooLarge256MiB { message } => UpstreamError::TooLarge256MiB { message: message.clone() },
        UpstreamError::Server { status, message } => UpstreamError::Server {
            status: *status,
            message: message.clone(),
        },
        UpstreamError::OtherClient { status, message } => UpstreamError::OtherClient {
            status: *status,
            message: message.clone(),
        },
        UpstreamError::Transport(s) => UpstreamError::Transport(s.clone()),
        UpstreamError::Timeout => UpstreamError::Timeout,
    };
    CoreError::Upstream(cloned)
}

fn apply_fallback_headers(response: &mut Response, reason: &str, original_status: StatusCode) {
    set_header(response, X_FALLBACK_APPLIED, "true");
    set_header(response, X_FALLBACK_REASON, reason);
    set_header(response, X_ORIGINAL_ERROR_STATUS, &original_status.as_u16().to_string());
}

fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_ceiling() {
        let (value, unit) = parse_duration_ceiling("duration must be between 1s and 10s").unwrap();
        assert_eq!(value, 10);
        assert_eq!(unit, "s");
    }

    #[test]
    fn non_duration_message_does_not_parse() {
        assert!(parse_duration_ceiling("internal server error").is_none());
    }

    #[test]
    fn duration_limit_registry_roundtrips() {
        let registry = DurationLimitRegistry::new();
        assert_eq!(registry.get("a.mp4"), None);
        registry.observe("a.mp4", 10);
        assert_eq!(registry.get("a.mp4"), Some(10));
    }
}
