//! Core type aliases shared across the cache engine.
//!
//! These mirror the narrow set of request/response/body/error aliases a Hyper-based
//! service needs, so the rest of the crate never spells out the underlying generics.

use http_body_util::combinators::UnsyncBoxBody;
use bytes::Bytes;

use crate::body::CacheBody;

/// Inbound request with a Hyper-native streaming body.
pub type Request = hyper::Request<hyper::body::Incoming>;

/// Outbound response using the crate's streaming body wrapper.
pub type Response = hyper::Response<CacheBody>;

/// Boxed body type used internally for type-erased streaming bodies.
pub(crate) type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

/// Boxed error type for thread-safe, dynamically-dispatched error handling.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
