//! Constants for the resilience engine.
//!
//! Tiger Style: All constants are explicitly typed with fixed limits
//! to prevent unbounded resource usage.

use std::time::Duration;

/// Default number of concurrent pool scans per pool group.
pub const DEFAULT_SCAN_WORKERS: u32 = 1;

/// Default number of concurrent file verifications per pool group.
pub const DEFAULT_VERIFY_WORKERS: u32 = 3;

/// Default number of concurrent copy/remove requests per pool group.
pub const DEFAULT_REQUEST_WORKERS: u32 = 10;

/// Upper bound on any worker pool size.
/// Tiger Style: Bounds concurrent network operations per group.
pub const MAX_WORKERS_PER_CATEGORY: u32 = 256;

/// Default bound on every namespace/pool round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default warm-up interval during which inbound events are suppressed.
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(60);

/// Default period between watchdog passes (24 hours).
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Default delay before the first watchdog pass.
pub const DEFAULT_WATCHDOG_INITIAL_DELAY: Duration = Duration::from_secs(300);

/// Default grace period before scanning a pool that went down.
pub const DEFAULT_POOL_DOWN_GRACE: Duration = Duration::from_secs(300);

/// Default number of re-verifications after a failed copy job.
pub const DEFAULT_MAX_JOB_RETRIES: u32 = 1;

/// Default interval between registry checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum number of files returned by a single pool scan query.
/// Tiger Style: Bounds per-scan memory.
pub const MAX_SCAN_RESULTS: u32 = 1_000_000;

/// Maximum number of records restored from a checkpoint.
pub const MAX_CHECKPOINT_RECORDS: usize = 1_000_000;

/// Separator between pool group name and file id in a registry key.
pub const OPERATION_KEY_SEPARATOR: char = '.';

// ============================================================================
// Compile-Time Constant Assertions
// ============================================================================

const _: () = assert!(DEFAULT_SCAN_WORKERS > 0);
const _: () = assert!(DEFAULT_VERIFY_WORKERS > 0);
const _: () = assert!(DEFAULT_REQUEST_WORKERS > 0);
const _: () = assert!(DEFAULT_REQUEST_WORKERS <= MAX_WORKERS_PER_CATEGORY);
const _: () = assert!(DEFAULT_REQUEST_TIMEOUT.as_millis() > 0);
const _: () = assert!(DEFAULT_WATCHDOG_INTERVAL.as_secs() > 0);
const _: () = assert!(MAX_SCAN_RESULTS > 0);
