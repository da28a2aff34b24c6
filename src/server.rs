//! HTTP server loop: accepts connections and dispatches every request straight
//! into a [`CacheOrchestrator`]. Generalized from the teacher crate's
//! `server.rs`/`router.rs` dispatch loop — same per-connection `hyper::server::conn::http1`
//! task-per-connection idiom — but with the router's path-matching dispatch
//! table removed entirely: the engine is a single-endpoint proxy (path-pattern
//! routing is explicitly out of scope, §1), so every request goes to the same
//! handler.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::{server::conn::http1, service::service_fn};
use tokio::net::TcpListener;

use crate::context::RequestContext;
use crate::orchestrator::CacheOrchestrator;
use crate::telemetry::EventSink;
use crate::types::BoxError;

/// Starts the cache engine's HTTP server on `listener`, dispatching every
/// request through `orchestrator`. Each accepted connection is handled on its
/// own task; requests within a connection are handled serially per HTTP/1.1
/// keep-alive semantics, but many connections proceed concurrently.
pub async fn serve(listener: TcpListener, orchestrator: Arc<CacheOrchestrator>, sink: Arc<dyn EventSink>) {
    if let Err(err) = run(listener, orchestrator, sink).await {
        tracing::error!(error = %err, "server loop exited");
    }
}

async fn run(
    listener: TcpListener,
    orchestrator: Arc<CacheOrchestrator>,
    sink: Arc<dyn EventSink>,
) -> Result<(), BoxError> {
    tracing::info!(addr = %listener.local_addr()?, "cache engine listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let orchestrator = orchestrator.clone();
        let sink = sink.clone();

        tokio::spawn(async move {
            let ctx = RequestContext::new(sink);
            let svc = service_fn(move |req| {
                let orchestrator = orchestrator.clone();
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(orchestrator.handle(req, &ctx).await) }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            if let Err(err) = http.serve_connection(io, svc).await {
                tracing::warn!(error = %err, "connection error");
            }
        });
    }
}
