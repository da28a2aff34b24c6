//! Property tests for range parsing (invariants 4-5) and key derivation
//! (invariants 1-2), run over generated inputs rather than fixed examples.

use proptest::prelude::*;

use rimcache::key::{self, Mode, TransformOptions};
use rimcache::range;

fn arb_opts() -> impl Strategy<Value = TransformOptions> {
    (
        prop_oneof![Just(Mode::Video), Just(Mode::Frame), Just(Mode::Spritesheet)],
        proptest::option::of("[0-9]{1,4}"),
        proptest::option::of("[0-9]{1,4}"),
        proptest::option::of("[a-z]{1,8}"),
    )
        .prop_map(|(mode, w, h, derivative)| TransformOptions {
            mode,
            derivative,
            w,
            h,
            ..Default::default()
        })
}

proptest! {
    /// Invariant 1: repeated derivation for the same input is identical.
    #[test]
    fn key_derivation_is_deterministic(path in "/[a-z/]{1,20}\\.mp4", opts in arb_opts()) {
        let a = key::derive(&path, &opts);
        let b = key::derive(&path, &opts);
        prop_assert_eq!(a, b);
    }

    /// Every derived key consists only of the sanitizer's allowed character set,
    /// regardless of how pathological the input path is.
    #[test]
    fn key_is_always_sanitized(path in ".{0,40}", opts in arb_opts()) {
        let ci = key::derive(&path, &opts);
        prop_assert!(ci.chars().all(|c| c.is_ascii_alphanumeric()
            || matches!(c, ':' | '/' | '=' | '.' | '*' | '-')));
    }

    /// Invariant 2: stripping a `v` param from a query string never changes the
    /// key, because key derivation never sees the query string directly.
    #[test]
    fn version_param_does_not_affect_key(path in "/[a-z/]{1,20}\\.mp4", opts in arb_opts(), v in 0u64..1000) {
        let with_v = key::strip_version_param(&format!("v={v}"));
        prop_assert_eq!(with_v, "");
        let ci = key::derive(&path, &opts);
        let ci_again = key::derive(&path, &opts);
        prop_assert_eq!(ci, ci_again);
    }

    /// Invariant 4/5: a satisfiable range always yields a window inside `[0, total)`
    /// whose length matches `end - start + 1`; everything else is rejected.
    #[test]
    fn range_parse_never_escapes_bounds(total in 1u64..1_000_000, start in 0u64..1_000_000, len in 1u64..1_000_000) {
        let end = start.saturating_add(len - 1);
        let header = format!("bytes={start}-{end}");
        match range::parse(&header, total) {
            Ok(range) => {
                prop_assert!(range.start <= range.end);
                prop_assert!(range.end < total);
                prop_assert_eq!(range.len(), range.end - range.start + 1);
            }
            Err(_) => {
                // Only acceptable when the requested start was already out of bounds.
                prop_assert!(start >= total);
            }
        }
    }

    /// A suffix range `bytes=-n` always resolves to the last `min(n, total)` bytes.
    #[test]
    fn suffix_range_takes_the_tail(total in 1u64..100_000, n in 1u64..100_000) {
        let header = format!("bytes=-{n}");
        let result = range::parse(&header, total);
        prop_assert!(result.is_ok());
        let range = result.unwrap();
        prop_assert_eq!(range.end, total - 1);
        prop_assert!(range.start <= range.end);
    }

    /// A range entirely past the end of the artifact is always unsatisfiable.
    #[test]
    fn out_of_bounds_range_is_rejected(total in 1u64..10_000, overshoot in 1u64..10_000) {
        let start = total + overshoot;
        let header = format!("bytes={start}-{}", start + 10);
        prop_assert!(range::parse(&header, total).is_err());
    }
}

#[test]
fn multi_range_requests_are_rejected() {
    assert!(range::parse("bytes=0-10,20-30", 1000).is_err());
}

#[test]
fn zero_total_length_is_never_satisfiable() {
    assert!(range::parse("bytes=0-10", 0).is_err());
}
