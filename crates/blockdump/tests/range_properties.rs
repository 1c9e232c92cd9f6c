//! Property tests for the window overlap test.
//!
//! Uses proptest to check the closed-interval overlap rule against its
//! direct definition for arbitrary ranges, including the extremes of `i64`.

use alopex_blockdump::Window;
use proptest::prelude::*;

/// Strategy for an ordered `(min, max)` pair.
fn range_strategy() -> impl Strategy<Value = (i64, i64)> {
    prop_oneof![
        (any::<i64>(), any::<i64>()),
        (-10_000i64..10_000, -10_000i64..10_000),
    ]
    .prop_map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
}

proptest! {
    /// Overlap holds exactly when the range starts before the window ends
    /// and ends after the window starts.
    #[test]
    fn test_overlap_matches_definition(w in range_strategy(), r in range_strategy()) {
        let window = Window::new(w.0, w.1).unwrap();
        prop_assert_eq!(window.overlaps(r.0, r.1), r.0 <= w.1 && r.1 >= w.0);
    }

    /// The intersection exists iff the ranges overlap, and lies in both.
    #[test]
    fn test_intersect_consistent_with_overlap(w in range_strategy(), r in range_strategy()) {
        let window = Window::new(w.0, w.1).unwrap();
        match window.intersect(r.0, r.1) {
            Some((lo, hi)) => {
                prop_assert!(window.overlaps(r.0, r.1));
                prop_assert!(lo <= hi);
                prop_assert!(w.0 <= lo && hi <= w.1);
                prop_assert!(r.0 <= lo && hi <= r.1);
            }
            None => prop_assert!(!window.overlaps(r.0, r.1)),
        }
    }

    /// Touching a boundary counts as overlap.
    #[test]
    fn test_touching_boundaries_overlap(start in -1_000_000i64..1_000_000, len in 0i64..1_000_000) {
        let window = Window::new(start, start + len).unwrap();
        prop_assert!(window.overlaps(start + len, start + len + 10));
        prop_assert!(window.overlaps(start - 10, start));
        prop_assert!(!window.overlaps(start + len + 1, start + len + 10));
    }

    /// The full window overlaps every range.
    #[test]
    fn test_full_window_overlaps_everything(r in range_strategy()) {
        prop_assert!(Window::full().overlaps(r.0, r.1));
    }
}
