// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for the contract invariants: deterministic slice identity
//! and the checkpoint key grammar.

use proptest::prelude::*;
use ucl_core::{BudgetHints, CheckpointKey, Slice, Watermark, slice_identity, slug};

proptest! {
    // Re-planning the same (unit, dimension, bounds) yields the same id.
    #[test]
    fn slice_identity_deterministic(
        unit in "[a-z0-9-]{1,24}",
        dim in "[a-z]{1,12}",
        lo in 0i64..1_000_000,
        width in 1i64..1_000_000,
    ) {
        let lower = Watermark::sequence(lo);
        let upper = Watermark::sequence(lo + width);
        let first = slice_identity(&unit, &dim, Some(&lower), Some(&upper));
        let second = slice_identity(&unit, &dim, Some(&lower), Some(&upper));
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), 64);
    }

    // Distinct bounds yield distinct ids.
    #[test]
    fn slice_identity_distinguishes_bounds(
        unit in "[a-z0-9-]{1,24}",
        lo in 0i64..1_000_000,
        width in 1i64..1_000_000,
    ) {
        let lower = Watermark::sequence(lo);
        let upper = Watermark::sequence(lo + width);
        let bounded = slice_identity(&unit, "seq", Some(&lower), Some(&upper));
        let open = slice_identity(&unit, "seq", Some(&lower), None);
        prop_assert_ne!(bounded, open);
    }

    // Slice::new agrees with the free function.
    #[test]
    fn slice_new_matches_identity(unit in "[a-z0-9-]{1,24}", lo in 0i64..1_000_000) {
        let budget = BudgetHints::default();
        let lower = Watermark::sequence(lo);
        let slice = Slice::new(unit.clone(), "seq", Some(lower.clone()), None, &budget);
        prop_assert_eq!(slice.slice_id, slice_identity(&unit, "seq", Some(&lower), None));
    }

    // Every slugged unit id produces a parseable key (within length limits).
    #[test]
    fn slugged_keys_parse(raw in "[a-zA-Z0-9 _.-]{1,40}") {
        let key = format!("tenant/acme/project/main/http/{}/updated", slug(&raw));
        if key.len() <= 128 {
            prop_assert!(CheckpointKey::parse(key).is_ok());
        }
    }

    // Keys longer than 128 bytes never validate.
    #[test]
    fn oversized_keys_rejected(extra in 100usize..300) {
        let key = format!("tenant/acme/project/main/http/{}", "x".repeat(extra));
        if key.len() > 128 {
            prop_assert!(CheckpointKey::parse(key).is_err());
        }
    }
}
