//! RangeSlicer (C4): parses `Range` headers and emits a byte-window view over a
//! chunk stream without ever holding more than one chunk in memory.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::{HeaderValue, StatusCode, header};

use crate::body::CacheBody;
use crate::error::InputError;
use crate::types::Response;

/// A satisfiable byte window, inclusive on both ends (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses a `Range: bytes=...` header value against a known total length `total`.
///
/// Supports the three shapes in §4.4: `bytes=a-b`, `bytes=a-` (open-ended), and
/// `bytes=-n` (suffix). Anything else, or a range that doesn't fit within
/// `[0, total)`, is unsatisfiable.
pub fn parse(header_value: &str, total: u64) -> Result<ByteRange, InputError> {
    let spec = header_value
        .strip_prefix("bytes=")
        .ok_or_else(|| InputError::MalformedRange(header_value.to_string()))?;

    // Reject multi-range requests (`bytes=0-10,20-30`); the engine only ever
    // serves a single contiguous window.
    if spec.contains(',') {
        return Err(InputError::UnsatisfiableRange { len: total });
    }

    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| InputError::MalformedRange(header_value.to_string()))?;

    let range = if start_str.is_empty() {
        // `bytes=-n`: the last n bytes.
        let n: u64 = end_str
            .parse()
            .map_err(|_| InputError::MalformedRange(header_value.to_string()))?;
        if n == 0 || total == 0 {
            return Err(InputError::UnsatisfiableRange { len: total });
        }
        ByteRange {
            start: total.saturating_sub(n),
            end: total - 1,
        }
    } else {
        let start: u64 = start_str
            .parse()
            .map_err(|_| InputError::MalformedRange(header_value.to_string()))?;
        let end = if end_str.is_empty() {
            total.saturating_sub(1)
        } else {
            end_str
                .parse()
                .map_err(|_| InputError::MalformedRange(header_value.to_string()))?
        };
        ByteRange { start, end }
    };

    if total == 0 || range.start > range.end || range.start >= total {
        return Err(InputError::UnsatisfiableRange { len: total });
    }
    let end = range.end.min(total - 1);
    Ok(ByteRange {
        start: range.start,
        end,
    })
}

/// Builds the 416 response for an unsatisfiable range (§4.4).
pub fn unsatisfiable_response(total: u64) -> Response {
    hyper::Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{total}"))
        .body(CacheBody::empty())
        .expect("static header values are always valid")
}

/// Trims a stream of contiguous chunks (each `Bytes`, covering consecutive byte
/// offsets starting at `stream_offset`) down to exactly `[range.start, range.end]`,
/// never buffering more than one chunk at a time.
pub fn slice_stream<S>(
    stream: S,
    stream_offset: u64,
    range: ByteRange,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>>
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    let mut consumed = stream_offset;
    stream.filter_map(move |chunk| {
        let chunk_start = consumed;
        let chunk_end = consumed + chunk.len() as u64; // exclusive
        consumed = chunk_end;

        if chunk_end <= range.start || chunk_start > range.end {
            return futures_util::future::ready(None);
        }
        let trim_front = range.start.saturating_sub(chunk_start) as usize;
        let keep_until = ((range.end + 1).min(chunk_end) - chunk_start) as usize;
        let slice = chunk.slice(trim_front..keep_until);
        futures_util::future::ready(Some(Ok(slice)))
    })
}

/// Builds the 206 response for a satisfiable range over an already-sliced body.
pub fn partial_response(range: ByteRange, total: u64, content_type: &str, body: CacheBody) -> Response {
    let content_range = format!("bytes {}-{}/{}", range.start, range.end, total);
    hyper::Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")))
        .header(header::CONTENT_RANGE, content_range)
        .header(header::CONTENT_LENGTH, range.len().to_string())
        .header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"))
        .body(body)
        .expect("range response headers are always valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn parses_explicit_range() {
        assert_eq!(parse("bytes=100-199", 10_000).unwrap(), ByteRange { start: 100, end: 199 });
    }

    #[test]
    fn parses_open_ended_range() {
        assert_eq!(parse("bytes=9990-", 10_000).unwrap(), ByteRange { start: 9990, end: 9999 });
    }

    #[test]
    fn parses_suffix_range() {
        assert_eq!(parse("bytes=-500", 10_000).unwrap(), ByteRange { start: 9500, end: 9999 });
    }

    #[test]
    fn rejects_out_of_bounds() {
        assert!(parse("bytes=20000-30000", 10_000).is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(parse("bytes=500-100", 10_000).is_err());
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse("bytes=abc-def", 10_000).is_err());
        assert!(parse("10-20", 10_000).is_err());
    }

    #[tokio::test]
    async fn slices_across_chunk_boundaries() {
        let body: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let chunks: Vec<Bytes> = body.chunks(128).map(Bytes::copy_from_slice).collect();
        let range = ByteRange { start: 150, end: 400 };
        let sliced = slice_stream(stream::iter(chunks), 0, range);
        let mut out = Vec::new();
        tokio::pin!(sliced);
        while let Some(chunk) = futures_util::StreamExt::next(&mut sliced).await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, body[150..=400]);
    }
}
