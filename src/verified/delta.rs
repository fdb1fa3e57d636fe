//! Replica delta computation.

use crate::types::OperationMode;

/// Compute the signed replica delta for `count` durable copies.
///
/// A negative result means the file is deficient and needs `|delta|` more
/// copies, a positive result means it is redundant by `delta` copies.
///
/// With `greedy` set, a deficient file is topped up to `maximum` and a
/// redundant file is trimmed down to `minimum`; otherwise the file is moved
/// just inside the bound it violates.
///
/// # Example
///
/// ```
/// use aspen_resilience::verified::compute_replica_delta;
///
/// assert_eq!(compute_replica_delta(1, 2, 3, false), -1);
/// assert_eq!(compute_replica_delta(1, 2, 3, true), -2);
/// assert_eq!(compute_replica_delta(5, 2, 3, false), 2);
/// assert_eq!(compute_replica_delta(5, 2, 3, true), 3);
/// assert_eq!(compute_replica_delta(2, 2, 3, true), 0);
/// ```
#[inline]
pub fn compute_replica_delta(count: u32, minimum: u32, maximum: u32, greedy: bool) -> i64 {
    debug_assert!(minimum <= maximum, "DELTA: minimum {minimum} > maximum {maximum}");

    let count = i64::from(count);
    let (minimum, maximum) = (i64::from(minimum), i64::from(maximum));

    if count < minimum {
        if greedy {
            count - maximum
        } else {
            count - minimum
        }
    } else if count > maximum {
        if greedy {
            count - minimum
        } else {
            count - maximum
        }
    } else {
        0
    }
}

/// Derive the operation mode from a computed delta.
#[inline]
pub fn mode_for_delta(verified: bool, delta: i64) -> OperationMode {
    if !verified {
        return OperationMode::None;
    }
    match delta {
        d if d < 0 => OperationMode::Replicate,
        d if d > 0 => OperationMode::Reduce,
        _ => OperationMode::None,
    }
}

/// Whether the outstanding need of an operation has been met.
///
/// `original_count - known == delta`: copies added while replicating and
/// copies removed while reducing both move `known` toward the target.
#[inline]
pub fn is_satisfied(original_count: u32, known: usize, delta: i64) -> bool {
    let known = i64::try_from(known).unwrap_or(i64::MAX);
    i64::from(original_count) - known == delta
}

/// Number of copies to request or remove for a delta.
#[inline]
pub fn request_count(delta: i64) -> u32 {
    u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX)
}
