//! Corrupt replicas are removed from their pool and never counted again.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use aspen_resilience::Envelope;
use aspen_resilience::FileId;
use aspen_resilience::ResilienceEvent;
use aspen_resilience::operation::operation_key;
use aspen_resilience::testing::group_topology;
use aspen_resilience::testing::test_config;
use aspen_resilience::testing::wait_until;
use aspen_resilience::types::JobOutcome;
use aspen_resilience::types::JobStatus;
use common::FOUR_POOLS;
use common::Harness;
use common::TEST_TIMEOUT;

fn pools(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// A file on `p1` and `p2` in a group needing three replicas, whose
/// operation is left registered by a refused copy request.
async fn tracked_deficient_file(id: &str) -> (Harness, FileId) {
    let harness = Harness::new(group_topology(&FOUR_POOLS, 3, 3), test_config());
    let file = harness.add_file(id, &["p1", "p2"]);
    harness.pools.refuse_next_copies(1);
    assert!(harness.location_added(&file, "p1"));

    let registry = Arc::clone(harness.service.context().registry());
    let key = operation_key("resilient", &file);
    assert!(wait_until(TEST_TIMEOUT, || registry.get(&key).is_some_and(|op| op.is_stalled())).await);
    (harness, file)
}

#[tokio::test]
async fn test_corrupt_replica_of_tracked_file_removed() {
    let (harness, file) = tracked_deficient_file("0001").await;

    let corrupt = Envelope::new(ResilienceEvent::CorruptFileDetected {
        file_id: file.clone(),
        pool: "p2".into(),
    });
    assert!(harness.service.dispatch(corrupt).unwrap());

    assert!(harness.settle(&file, 3).await, "file never reached three good replicas");
    assert!(harness.pools.removals().contains(&(file.clone(), "p2".to_string())));
    assert_eq!(harness.namespace.locations(&file), pools(&["p1", "p3", "p4"]));

    let copies = harness.pools.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].request.count, 2);
    assert!(copies[0].request.exclude_pools.contains("p2"));
}

#[tokio::test]
async fn test_corrupt_job_report_removes_replica() {
    let (harness, file) = tracked_deficient_file("0002").await;

    let status = Envelope::new(ResilienceEvent::JobStatus(JobStatus {
        file_id: file.clone(),
        pool_group: "resilient".into(),
        pool: Some("p2".into()),
        job_id: None,
        outcome: JobOutcome::Corrupt,
    }));
    assert!(harness.service.dispatch(status).unwrap());

    assert!(harness.settle(&file, 3).await, "file never reached three good replicas");
    assert!(harness.pools.removals().contains(&(file.clone(), "p2".to_string())));
    assert!(!harness.namespace.locations(&file).contains("p2"));
}

#[tokio::test]
async fn test_corrupt_replica_of_untracked_file_replaced() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0003", &["p1", "p2"]);

    let corrupt = Envelope::new(ResilienceEvent::CorruptFileDetected {
        file_id: file.clone(),
        pool: "p2".into(),
    });
    assert!(harness.service.dispatch(corrupt).unwrap());

    assert!(harness.settle(&file, 2).await, "file never got its second replica back");
    assert_eq!(harness.pools.removals(), vec![(file.clone(), "p2".to_string())]);
    assert!(!harness.namespace.locations(&file).contains("p2"));
}
