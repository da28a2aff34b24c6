//! Error taxonomy for the cache engine.
//!
//! Each module returns its own narrow error enum; [`CoreError`] wraps them at the
//! crate boundary so `?` composes across module lines without manual mapping, and
//! centralizes the HTTP-facing rendering described for terminal error responses.

use http::StatusCode;
use thiserror::Error;

/// Failures in parsing or validating caller-supplied input (principally `Range`).
#[derive(Debug, Error)]
pub enum InputError {
    #[error("missing Range header")]
    MissingRange,
    #[error("malformed Range header: {0}")]
    MalformedRange(String),
    #[error("range not satisfiable for length {len}")]
    UnsatisfiableRange { len: u64 },
}

/// Blob-store failures, split along the retry/terminal axis used by §4.2/§4.3's
/// exponential-backoff policy.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store rate-limited or conflicted: {0}")]
    RateLimitOrConflict(String),
    #[error("store operation failed terminally: {0}")]
    Terminal(String),
    #[error("manifest for {ci} references {expected} chunks but {found} are present")]
    ManifestMismatch {
        ci: String,
        expected: usize,
        found: usize,
    },
    #[error("chunk lock for {ci} held by another writer")]
    LockContended { ci: String },
}

/// Kinds of non-2xx response the upstream transformer can produce.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("duration out of range: {message}")]
    Duration { message: String },
    #[error("file too large: {message}")]
    FileSize { message: String },
    #[error("video exceeds 256MiB limit: {message}")]
    TooLarge256MiB { message: String },
    #[error("upstream server error {status}: {message}")]
    Server { status: StatusCode, message: String },
    #[error("upstream client error {status}: {message}")]
    OtherClient { status: StatusCode, message: String },
    #[error("upstream transport failure: {0}")]
    Transport(String),
    #[error("upstream request timed out")]
    Timeout,
}

/// Direct-origin fetch failures (fallback step 2/3).
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin fetch failed: {0}")]
    Fetch(String),
    #[error("origin returned {status}")]
    Status { status: StatusCode },
    #[error("no direct origin URL is configured for this request")]
    Unavailable,
}

/// Coalescer and concurrency-gate failures.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("coalescer wait timed out after {waited_ms}ms")]
    WaitTimeout { waited_ms: u64 },
    #[error("concurrency gate rejected: queue depth exceeds hard limit")]
    Backpressure,
}

/// Crate-wide error, composed from the narrower per-module enums above.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Origin(#[from] OriginError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
}

/// The JSON body every terminal error response carries, per §7.
#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub details: serde_json::Value,
}

impl CoreError {
    /// Maps this error to the HTTP status a terminal response should carry.
    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::Input(InputError::UnsatisfiableRange { .. }) => {
                StatusCode::RANGE_NOT_SATISFIABLE
            }
            CoreError::Input(_) => StatusCode::BAD_REQUEST,
            CoreError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Upstream(UpstreamError::Server { status, .. }) => *status,
            CoreError::Upstream(UpstreamError::OtherClient { status, .. }) => *status,
            CoreError::Upstream(_) => StatusCode::BAD_GATEWAY,
            CoreError::Origin(OriginError::Status { status }) => *status,
            CoreError::Origin(_) => StatusCode::BAD_GATEWAY,
            CoreError::Concurrency(ConcurrencyError::Backpressure) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Concurrency(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Builds the `{error, message, statusCode, details}` body described in §7.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind_name().to_string(),
            message: self.to_string(),
            status_code: self.status().as_u16(),
            details: serde_json::Value::Null,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            CoreError::Input(_) => "InputError",
            CoreError::Store(_) => "StoreError",
            CoreError::Upstream(_) => "UpstreamError",
            CoreError::Origin(_) => "OriginError",
            CoreError::Concurrency(_) => "ConcurrencyError",
        }
    }
}
