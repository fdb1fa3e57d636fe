//! Pool-group bound folding.

/// Fold storage-unit bounds into a group-wide over-approximation.
///
/// The result takes the largest minimum and the smallest maximum across the
/// group defaults and every linked unit. A scan using these bounds selects
/// every file that could violate any unit's bounds, so it never misses a
/// file; it may select files that turn out to be fine. The folded minimum
/// may exceed the folded maximum, which only widens the selection.
///
/// # Example
///
/// ```
/// use aspen_resilience::verified::fold_group_bounds;
///
/// assert_eq!(fold_group_bounds((1, 5), [(2, 4), (3, 6)]), (3, 4));
/// assert_eq!(fold_group_bounds((2, 3), Vec::new()), (2, 3));
/// ```
pub fn fold_group_bounds(defaults: (u32, u32), units: impl IntoIterator<Item = (u32, u32)>) -> (u32, u32) {
    units
        .into_iter()
        .fold(defaults, |(minimum, maximum), (unit_min, unit_max)| (minimum.max(unit_min), maximum.min(unit_max)))
}

/// Whether a replica count falls outside folded group bounds.
#[inline]
pub fn needs_adjustment(count: u32, minimum: u32, maximum: u32) -> bool {
    count < minimum || count > maximum
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_fold_greatest_lower_least_upper() {
        assert_eq!(fold_group_bounds((1, 5), vec![(2, 4), (3, 6)]), (3, 4));
    }

    #[test]
    fn test_fold_may_invert() {
        assert_eq!(fold_group_bounds((1, 5), vec![(2, 2), (4, 6)]), (4, 2));
        assert!(needs_adjustment(3, 4, 2));
    }

    proptest! {
        #[test]
        fn test_fold_has_no_false_negatives(
            defaults in (1u32..5, 5u32..10),
            units in prop::collection::vec((1u32..5, 5u32..10), 0..6),
            count in 0u32..12,
        ) {
            let (minimum, maximum) = fold_group_bounds(defaults, units.clone());
            let violates_any = std::iter::once(defaults)
                .chain(units)
                .any(|(lo, hi)| needs_adjustment(count, lo, hi));
            if violates_any {
                prop_assert!(needs_adjustment(count, minimum, maximum));
            }
        }
    }
}
