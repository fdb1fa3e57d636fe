//! Timeouts and transient refusals leave operations registered until the
//! next trigger, whether that is an event or a watchdog pass.

mod common;

use std::sync::Arc;

use aspen_resilience::FileId;
use aspen_resilience::operation::operation_key;
use aspen_resilience::stats::Counter;
use aspen_resilience::testing::wait_until;
use common::Harness;
use common::TEST_TIMEOUT;

/// Wait until the operation for `file_id` is registered and stalled.
async fn stalled(harness: &Harness, file_id: &FileId) -> bool {
    let registry = Arc::clone(harness.service.context().registry());
    let key = operation_key("resilient", file_id);
    wait_until(TEST_TIMEOUT, || registry.get(&key).is_some_and(|op| op.is_stalled())).await
}

#[tokio::test]
async fn test_refused_copy_retried_on_next_event() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0001", &["p1"]);
    harness.pools.refuse_next_copies(1);

    assert!(harness.location_added(&file, "p1"));
    assert!(stalled(&harness, &file).await, "operation never stalled");
    assert!(harness.pools.copies().is_empty());
    assert!(harness.service.stats().counter(Counter::TransientFailures) >= 1);
    assert_eq!(harness.service.context().registry().len(), 1);

    // Any event reaching the stalled operation starts it over.
    assert!(harness.location_added(&file, "p1"));
    assert!(harness.settle(&file, 2).await, "file never reached two replicas");
    assert_eq!(harness.pools.copies().len(), 1);
    assert!(harness.alarms.alarms().is_empty());
}

#[tokio::test]
async fn test_refused_copy_retried_by_watchdog_pass() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0002", &["p1"]);
    harness.pools.refuse_next_copies(1);

    assert!(harness.location_added(&file, "p1"));
    assert!(stalled(&harness, &file).await, "operation never stalled");

    // The stalled operation's source pool is scanned, not skipped.
    let summary = harness.service.watchdog().run_pass().await;
    assert!(summary.scanned.contains(&"p1".to_string()));
    assert!(summary.skipped.is_empty());

    assert!(harness.settle(&file, 2).await, "file never reached two replicas");
    assert_eq!(harness.pools.copies().len(), 1);
}

#[tokio::test]
async fn test_refused_removal_retried_by_watchdog_pass() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0003", &["p1", "p2", "p3"]);
    harness.pools.refuse_next_removals(1);

    assert!(harness.location_added(&file, "p3"));
    assert!(stalled(&harness, &file).await, "operation never stalled");
    assert!(harness.pools.removals().is_empty());
    assert_eq!(harness.namespace.locations(&file).len(), 3);

    let summary = harness.service.watchdog().run_pass().await;
    assert!(summary.scanned.contains(&"p3".to_string()));

    assert!(harness.settle(&file, 2).await, "file never came down to two replicas");
    assert_eq!(harness.pools.removals().len(), 1);
}
