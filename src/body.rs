//! Streaming HTTP body wrapper and the stream-tee primitive used to fan a single
//! upstream body out to multiple waiters without ever materializing it fully.
//!
//! `CacheBody` wraps a type-erased [`http_body::Body`] so every layer of the engine
//! (orchestrator, range slicer, fallback pipeline) can move bodies around without
//! caring whether the underlying bytes come from a `Full`, a chunk stream pulled off
//! the blob store, or a tee of someone else's in-flight response.

use std::{
    fmt::Debug,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::{Stream, TryStream, TryStreamExt};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::broadcast;

use crate::types::{BoxBody, BoxError};

/// A streaming HTTP body. Every response the engine produces — cache hit, cache
/// miss, range slice, or fallback — is ultimately boxed into one of these.
pub struct CacheBody(BoxBody);

impl CacheBody {
    /// Wraps any `Body<Data = Bytes>` implementation, erasing its concrete type.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(Into::into).boxed_unsync())
    }

    /// Builds a body from a stream of byte chunks, each fallible.
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + Debug + 'static,
    {
        let stream = stream.map_err(Into::into).map_ok(Frame::data);
        Self(StreamBody::new(stream).boxed_unsync())
    }

    /// Builds a body directly from a stream of HTTP frames (data or trailers).
    pub fn from_try_stream<S, E>(stream: S) -> Self
    where
        S: TryStream<Ok = Frame<Bytes>, Error = E> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self(StreamBody::new(stream.map_err(Into::into)).boxed_unsync())
    }

    /// An empty, immediately-complete body (204s, 304s, HEAD responses).
    pub fn empty() -> Self {
        Self::new(Empty::new())
    }
}

impl Default for CacheBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<()> for CacheBody {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl From<&str> for CacheBody {
    fn from(buf: &str) -> Self {
        Self::new(Full::from(buf.to_owned().into_bytes()))
    }
}

macro_rules! body_from_impl {
    ($ty:ty) => {
        impl From<$ty> for CacheBody {
            fn from(buf: $ty) -> Self {
                Self::new(Full::from(buf))
            }
        }
    };
}

body_from_impl!(String);
body_from_impl!(Vec<u8>);
body_from_impl!(Bytes);

impl Body for CacheBody {
    type Data = Bytes;
    type Error = BoxError;

    #[inline]
    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.0.size_hint()
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}

/// Fans a single upstream body out to N waiters without buffering the whole thing.
///
/// The owner drives [`Tee::feed`] chunk-by-chunk as bytes arrive from upstream;
/// every subscriber obtained via [`Tee::subscribe`] sees the same chunks in order
/// as an independent [`CacheBody`]. This is the coalescer's only sanctioned way to
/// share a response body across waiters (see the single-flight contract in C6) —
/// no call site may read a body fully into memory just to clone it out again.
#[derive(Clone)]
pub struct Tee {
    tx: broadcast::Sender<TeeItem>,
}

#[derive(Clone)]
enum TeeItem {
    Chunk(Bytes),
    Done,
    Err(String),
}

impl Tee {
    /// Creates a tee with room for `capacity` in-flight chunks per subscriber
    /// before a slow subscriber starts lagging (and observes gaps as an error).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Pushes the next chunk of the owner's body to every current/future subscriber.
    pub fn feed(&self, chunk: Bytes) {
        let _ = self.tx.send(TeeItem::Chunk(chunk));
    }

    /// Signals normal completion of the owner's body.
    pub fn finish(&self) {
        let _ = self.tx.send(TeeItem::Done);
    }

    /// Signals that the owner's body ended in error; subscribers observe it too.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(TeeItem::Err(message.into()));
    }

    /// Returns a body that streams exactly what the owner feeds, from this point on.
    pub fn subscribe(&self) -> CacheBody {
        let mut rx = self.tx.subscribe();
        let stream = async_stream::try_stream! {
            loop {
                match rx.recv().await {
                    Ok(TeeItem::Chunk(b)) => yield b,
                    Ok(TeeItem::Done) => break,
                    Ok(TeeItem::Err(msg)) => Err(std::io::Error::other(msg))?,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        Err(std::io::Error::other("tee subscriber lagged"))?
                    }
                }
            }
        };
        CacheBody::from_stream(stream)
    }
}
