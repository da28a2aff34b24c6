//! Targeted invariant checks not already exercised by a concrete scenario or
//! by a module's own `#[cfg(test)]` unit tests.

mod support;

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use rimcache::config::Config;

use support::{get, spawn_server, FakeTransformer, Scripted};

/// Invariant 8: a response the upstream marked partial (206 or carrying
/// `Content-Range`) is never cached, so the identical request that follows it
/// is still a MISS rather than replaying the truncated body.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_upstream_responses_are_never_cached() {
    let transformer = Arc::new(FakeTransformer::scripted(|_, _| Scripted::Partial {
        body: vec![1, 2, 3, 4],
        content_type: "video/mp4",
    }));
    let addr = spawn_server(Config::default(), transformer.clone()).await;

    let (first, _) = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    assert_eq!(first.status, StatusCode::PARTIAL_CONTENT);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (second, _) = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    assert_eq!(second.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        second.headers.get("x-cache-status").unwrap(),
        "MISS",
        "a partial upstream response must never be served from the store as a HIT"
    );
    assert_eq!(
        transformer.call_count(),
        2,
        "every request for an uncacheable partial response re-invokes the transformer"
    );
}

/// Bypass query parameters (`debug`, `nocache`, `bypass` by default) skip the
/// store entirely even when a cached copy already exists.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bypass_param_skips_an_existing_cache_entry() {
    let transformer = Arc::new(FakeTransformer::canned(vec![9; 16], "video/mp4"));
    let addr = spawn_server(Config::default(), transformer.clone()).await;

    let _ = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transformer.call_count(), 1);

    let (parts, _) = get(addr, "/videos/a.mp4?w=640&h=360&debug=1", None).await;
    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(
        transformer.call_count(),
        2,
        "a bypass param must force a fresh upstream fetch even on a warm key"
    );
}

/// `X-Cache-Key` always carries the derived cache identity, not the bare
/// source path, on every response shape (miss, hit, waiter).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_key_header_is_the_derived_identity_not_the_path() {
    let transformer = Arc::new(FakeTransformer::canned(vec![3; 8], "video/mp4"));
    let addr = spawn_server(Config::default(), transformer.clone()).await;

    let (miss, _) = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    assert_eq!(
        miss.headers.get("x-cache-key").unwrap(),
        "video:videos/a.mp4:w=640:h=360"
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (hit, _) = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    assert_eq!(
        hit.headers.get("x-cache-key").unwrap(),
        "video:videos/a.mp4:w=640:h=360"
    );
}

/// Unrelated requested parameters (e.g. a derivative name) collapse distinct
/// dimension combinations onto the same stored artifact.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn derivative_requests_share_one_cache_slot() {
    let transformer = Arc::new(FakeTransformer::canned(vec![5; 32], "video/mp4"));
    let addr = spawn_server(Config::default(), transformer.clone()).await;

    let _ = get(addr, "/videos/a.mp4?derivative=mobile&w=640", None).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (parts, _) = get(addr, "/videos/a.mp4?derivative=mobile&w=1920", None).await;

    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(
        transformer.call_count(),
        1,
        "two requests naming the same derivative must resolve to one cache identity"
    );
    assert_eq!(parts.headers.get("x-cache-status").unwrap(), "HIT");
}
