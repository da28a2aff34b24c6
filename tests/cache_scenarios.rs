//! End-to-end scenarios driven against a real server (S1-S6).

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use rimcache::config::Config;
use rimcache::error::UpstreamError;

use support::{get, spawn_server, FakeTransformer, Scripted};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_cold_miss_then_hot_hit() {
    let body = vec![7u8; 2048];
    let transformer = Arc::new(FakeTransformer::canned(body.clone(), "video/mp4"));
    let addr = spawn_server(Config::default(), transformer.clone()).await;

    let (parts, collected) = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(collected.len(), body.len());
    assert_eq!(
        parts.headers.get("x-cache-status").unwrap(),
        "MISS",
        "first request for a cold key must report MISS"
    );

    let requested = transformer.requests.lock();
    let last = requested.last().unwrap();
    assert!(last.url.contains("width=640"));
    assert!(last.url.contains("height=360"));
    drop(requested);

    // Give the background store write a beat to land before the follow-up hit.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (parts2, collected2) = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    assert_eq!(parts2.status, StatusCode::OK);
    assert_eq!(collected2, collected, "hit body must match the originally cached bytes");
    assert_eq!(parts2.headers.get("x-cache-status").unwrap(), "HIT");
    assert_eq!(transformer.call_count(), 1, "a cache hit must not re-invoke the transformer");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_hot_hit_with_range() {
    let body: Vec<u8> = (0..10_000u32).map(|n| (n % 256) as u8).collect();
    let transformer = Arc::new(FakeTransformer::canned(body.clone(), "video/mp4"));
    let addr = spawn_server(Config::default(), transformer).await;

    let _ = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (parts, collected) = get(addr, "/videos/a.mp4?w=640&h=360", Some("bytes=100-199")).await;
    assert_eq!(parts.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        parts.headers.get(http::header::CONTENT_RANGE).unwrap(),
        "bytes 100-199/10000"
    );
    assert_eq!(parts.headers.get(http::header::CONTENT_LENGTH).unwrap(), "100");
    assert_eq!(collected.as_ref(), &body[100..=199]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s3_unsatisfiable_range() {
    let body: Vec<u8> = (0..10_000u32).map(|n| (n % 256) as u8).collect();
    let transformer = Arc::new(FakeTransformer::canned(body, "video/mp4"));
    let addr = spawn_server(Config::default(), transformer).await;

    let _ = get(addr, "/videos/a.mp4?w=640&h=360", None).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (parts, _) = get(addr, "/videos/a.mp4?w=640&h=360", Some("bytes=20000-30000")).await;
    assert_eq!(parts.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(parts.headers.get(http::header::CONTENT_RANGE).unwrap(), "bytes */10000");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_chunked_artifact_round_trips_and_ranges() {
    let mut config = Config::default();
    config.chunk_max_bytes = 1_000_000;
    config.chunk_size_target = 1_000_000;

    let body_len = 3_500_000usize;
    let body: Vec<u8> = (0..body_len).map(|n| (n % 256) as u8).collect();
    let transformer = Arc::new(FakeTransformer::canned(body.clone(), "video/mp4"));
    let addr = spawn_server(config, transformer).await;

    let (parts, collected) = get(addr, "/videos/big.mp4?w=1920&h=1080", None).await;
    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(collected.len(), body_len);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (parts2, sliced) = get(addr, "/videos/big.mp4?w=1920&h=1080", Some("bytes=1500000-2500000")).await;
    assert_eq!(parts2.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(sliced.as_ref(), &body[1_500_000..=2_500_000]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_duration_adjust_retry() {
    let good_body = b"trimmed-clip".to_vec();
    let good_body_for_closure = good_body.clone();
    let transformer = Arc::new(FakeTransformer::scripted(move |index, request| {
        if index == 0 {
            assert_eq!(request.params.get("duration").map(String::as_str), Some("15s"));
            Scripted::Err(UpstreamError::Duration {
                message: "duration must be between 1s and 10s".to_string(),
            })
        } else {
            assert_eq!(request.params.get("duration").map(String::as_str), Some("10s"));
            Scripted::Ok {
                body: good_body_for_closure.clone(),
                content_type: "video/mp4",
            }
        }
    }));
    let addr = spawn_server(Config::default(), transformer.clone()).await;

    let (parts, collected) = get(addr, "/videos/a.mp4?duration=15s", None).await;
    assert_eq!(parts.status, StatusCode::OK);
    assert_eq!(collected.as_ref(), good_body.as_slice());
    assert_eq!(parts.headers.get("x-duration-adjusted").unwrap(), "true");
    assert_eq!(parts.headers.get("x-original-duration").unwrap(), "15s");
    assert_eq!(parts.headers.get("x-adjusted-duration").unwrap(), "10s");
    assert_eq!(transformer.call_count(), 2, "exactly one retry after the duration error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn s6_single_flight_under_load() {
    let body = vec![42u8; 4096];
    let transformer = Arc::new(
        FakeTransformer::canned(body.clone(), "video/mp4").with_delay(Duration::from_millis(400)),
    );
    let addr = spawn_server(Config::default(), transformer.clone()).await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        handles.push(tokio::spawn(async move { get(addr, "/videos/a.mp4?w=640&h=360", None).await }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        let (parts, collected) = handle.await.unwrap();
        assert_eq!(parts.status, StatusCode::OK);
        bodies.push(collected);
    }

    assert!(bodies.iter().all(|b| b.as_ref() == body.as_slice()));
    assert_eq!(
        transformer.calls.load(Ordering::SeqCst),
        1,
        "50 concurrent misses for the same key must invoke the upstream exactly once"
    );
}
