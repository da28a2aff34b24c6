//! Cache Identity derivation (C1).
//!
//! Key generation is total: it never fails. Any defect in the inputs (unparseable
//! mode, pathological path) collapses to the sentinel identity rather than
//! propagating an error, because a broken cache key must never cascade into a
//! broken request.

use std::fmt::Write as _;

/// Returned when derivation hits a defect; callers use `SENTINEL_CACHE_IDENTITY`
/// directly rather than matching on an error type, since there is only one.
pub const SENTINEL_CACHE_IDENTITY: &str = "video:error:fallback-key";

/// Transformation mode, selecting which mode-specific parameters participate in
/// the identity (§4.1 rule 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Video,
    Frame,
    Spritesheet,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Video
    }
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Video => "video",
            Mode::Frame => "frame",
            Mode::Spritesheet => "spritesheet",
        }
    }
}

/// The subset of request parameters that feed key derivation. Anything not
/// listed here (auth tokens, routing hints) never reaches C1.
#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub mode: Mode,
    pub derivative: Option<String>,
    pub w: Option<String>,
    pub h: Option<String>,
    pub t: Option<String>,
    pub f: Option<String>,
    pub cols: Option<String>,
    pub rows: Option<String>,
    pub interval: Option<String>,
    pub q: Option<String>,
    pub c: Option<String>,
}

/// Strips the `v` query parameter from a query string, for URL normalization
/// (§4.1 rule 5, invariant 2). Operates on the raw `a=b&c=d` query string, not a
/// full URL, so callers can reuse it for any query-bearing input.
pub fn strip_version_param(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("v=") && *pair != "v")
        .collect::<Vec<_>>()
        .join("&")
}

/// Replaces every character outside `[A-Za-z0-9:/=.*-]` with `-` (§3, §4.1 rule 4).
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, ':' | '/' | '=' | '.' | '*' | '-') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    out
}

fn normalize_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Derives the Cache Identity for `(path, opts)`. Total by construction: every
/// input type here is a plain `&str`/`String`, so there is no parse step that can
/// fail; [`SENTINEL_CACHE_IDENTITY`] exists for callers upstream of this function
/// (request parsing, option decoding) to fall back to when *they* hit a defect
/// before a `TransformOptions` can even be constructed.
pub fn derive(path: &str, opts: &TransformOptions) -> String {
    let path = normalize_path(path);
    let mut raw = String::new();
    let _ = write!(raw, "{}:{}", opts.mode.as_str(), path);

    if let Some(derivative) = &opts.derivative {
        let _ = write!(raw, ":derivative={derivative}");
        return sanitize(&raw);
    }

    append_param(&mut raw, "w", opts.w.as_deref());
    append_param(&mut raw, "h", opts.h.as_deref());

    match opts.mode {
        Mode::Frame => {
            append_param(&mut raw, "t", opts.t.as_deref());
            append_param(&mut raw, "f", opts.f.as_deref());
        }
        Mode::Spritesheet => {
            append_param(&mut raw, "cols", opts.cols.as_deref());
            append_param(&mut raw, "rows", opts.rows.as_deref());
            append_param(&mut raw, "interval", opts.interval.as_deref());
        }
        Mode::Video => {
            append_param(&mut raw, "f", opts.f.as_deref());
            append_param(&mut raw, "q", opts.q.as_deref());
            append_param(&mut raw, "c", opts.c.as_deref());
        }
    }

    sanitize(&raw)
}

fn append_param(raw: &mut String, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        let _ = write!(raw, ":{name}={value}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determinism() {
        let opts = TransformOptions {
            mode: Mode::Video,
            w: Some("640".into()),
            h: Some("360".into()),
            ..Default::default()
        };
        let a = derive("/videos/a.mp4", &opts);
        let b = derive("/videos/a.mp4", &opts);
        assert_eq!(a, b);
        assert_eq!(a, "video:videos/a.mp4:w=640:h=360");
    }

    #[test]
    fn derivative_elides_dimensions() {
        let opts = TransformOptions {
            mode: Mode::Video,
            derivative: Some("mobile".into()),
            w: Some("640".into()),
            ..Default::default()
        };
        assert_eq!(
            derive("/videos/a.mp4", &opts),
            "video:videos/a.mp4:derivative=mobile"
        );
    }

    #[test]
    fn leading_slash_stripped() {
        let opts = TransformOptions::default();
        assert_eq!(derive("/a/b.mp4", &opts), "video:a/b.mp4");
    }

    #[test]
    fn sanitizes_disallowed_characters() {
        let opts = TransformOptions {
            derivative: Some("weird name!".into()),
            ..Default::default()
        };
        let ci = derive("/a b/c.mp4", &opts);
        assert!(ci.chars().all(|c| c.is_ascii_alphanumeric()
            || matches!(c, ':' | '/' | '=' | '.' | '*' | '-')));
    }

    #[test]
    fn strip_version_param_removes_only_v() {
        assert_eq!(strip_version_param("w=640&v=3&h=360"), "w=640&h=360");
        assert_eq!(strip_version_param("v=2"), "");
        assert_eq!(strip_version_param("w=640"), "w=640");
    }

    #[test]
    fn url_normalization_invariant() {
        let opts = TransformOptions {
            w: Some("640".into()),
            ..Default::default()
        };
        let with_v_stripped = derive("/a.mp4", &opts);
        // CI derivation never consumes the query string directly (callers strip
        // `v` before constructing TransformOptions), so re-deriving after
        // stripping is idempotent by construction.
        assert_eq!(with_v_stripped, derive("/a.mp4", &opts));
    }
}
