//! End-to-end replica lifecycle: events in, copies and removals out.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use aspen_resilience::Envelope;
use aspen_resilience::FileId;
use aspen_resilience::OperationFilter;
use aspen_resilience::ResilienceEvent;
use aspen_resilience::clients::AlarmKind;
use aspen_resilience::operation::FileReplicaOperation;
use aspen_resilience::operation::operation_key;
use aspen_resilience::stats::Counter;
use aspen_resilience::testing::test_config;
use aspen_resilience::testing::wait_until;
use aspen_resilience::types::AccessLatency;
use aspen_resilience::types::EventKind;
use aspen_resilience::types::FileAttributes;
use common::Harness;
use common::TEST_TIMEOUT;

#[tokio::test]
async fn test_deficient_file_replicated_to_minimum() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0001", &["p1"]);

    assert!(harness.location_added(&file, "p1"));
    assert!(harness.settle(&file, 2).await, "file never reached two replicas");

    let copies = harness.pools.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].request.source, "p1");
    assert_eq!(copies[0].request.count, 1);
    assert!(copies[0].request.exclude_pools.contains("p1"));
    assert_eq!(copies[0].request.session, harness.service.session());
    assert!(harness.alarms.alarms().is_empty());

    // Nothing else happens once the count is within bounds.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.pools.copies().len(), 1);
    assert!(harness.service.stats().counter(Counter::OperationsSatisfied) >= 1);
}

#[tokio::test]
async fn test_redundant_file_reduced_to_maximum() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0002", &["p1", "p2", "p3", "p4"]);

    assert!(harness.location_added(&file, "p1"));
    assert!(harness.settle(&file, 2).await, "file never came down to two replicas");

    // The pool the new replica landed on keeps it.
    assert!(harness.namespace.locations(&file).contains("p1"));
    assert_eq!(harness.pools.removals().len(), 2);
    assert!(harness.pools.copies().is_empty());

    // Each removal echoes back tagged with our session and is dropped.
    let service = harness.service.clone();
    assert!(wait_until(TEST_TIMEOUT, || service.stats().counter(Counter::EventsRejectedSelf) == 2).await);
    assert!(service.context().registry().is_empty());
}

#[tokio::test]
async fn test_failed_copies_retried_then_alarmed() {
    let mut config = test_config();
    config.max_job_retries = 1;
    let harness = Harness::new(
        aspen_resilience::testing::group_topology(&common::FOUR_POOLS, 2, 2),
        config,
    );
    let file = harness.add_file("0003", &["p1"]);
    harness.pools.fail_next_copies(2);

    assert!(harness.location_added(&file, "p1"));
    let alarms = harness.alarms.clone();
    assert!(wait_until(TEST_TIMEOUT, || alarms.count(AlarmKind::OperationFailed) == 1).await);

    assert_eq!(harness.pools.copies().len(), 2);
    assert_eq!(harness.namespace.locations(&file).len(), 1);
    assert!(harness.service.context().registry().is_empty());
}

#[tokio::test]
async fn test_file_without_replicas_raises_lost_alarm() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0004", &[]);

    harness
        .service
        .dispatch(Envelope::new(ResilienceEvent::LocationCleared {
            file_id: file.clone(),
            pool: "p1".into(),
        }))
        .unwrap();

    let alarms = harness.alarms.clone();
    assert!(wait_until(TEST_TIMEOUT, || alarms.count(AlarmKind::LostFile) == 1).await);
    assert!(harness.service.context().registry().is_empty());
    assert!(harness.pools.copies().is_empty());
}

#[tokio::test]
async fn test_nearline_file_left_alone() {
    let harness = Harness::four_pools(2, 2);
    let file = FileId::new("0005");
    let mut attributes = FileAttributes::online(file.clone());
    attributes.access_latency = AccessLatency::Nearline;
    harness.namespace.add_file(attributes, ["p1"]);

    assert!(harness.location_added(&file, "p1"));
    assert!(harness.settle(&file, 1).await);
    assert!(harness.pools.copies().is_empty());
}

#[tokio::test]
async fn test_unreadable_only_replica_raises_inaccessible_alarm() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0006", &["p1"]);
    harness.pools.set_unreachable("p1", true);

    assert!(harness.location_added(&file, "p1"));
    let registry = harness.service.context().registry().clone();
    let key = format!("resilient.{file}");
    // The only replica cannot be checked, so it is not counted.
    let alarms = harness.alarms.clone();
    assert!(wait_until(TEST_TIMEOUT, || alarms.count(AlarmKind::InaccessibleFile) == 1).await);
    assert!(registry.get(&key).is_none());

    harness.pools.set_unreachable("p1", false);
    assert!(harness.location_added(&file, "p1"));
    assert!(harness.settle(&file, 2).await);
}

#[tokio::test]
async fn test_operator_cancel_removes_operations() {
    let harness = Harness::four_pools(2, 2);
    let admin = harness.service.admin();
    let file = harness.add_file("0007", &["p1"]);

    // Registered directly, so no task picks it up before the cancel.
    let registry = harness.service.context().registry().clone();
    let op = aspen_resilience::operation::FileReplicaOperation::new(
        file.clone(),
        "resilient",
        Some("p1".into()),
        aspen_resilience::types::EventKind::Indeterminate,
    )
    .shared();
    registry.register(op).unwrap();

    let filter = OperationFilter {
        pool: Some("p1".into()),
        ..OperationFilter::default()
    };
    assert_eq!(admin.list_operations(&filter).len(), 1);
    let summary = admin.cancel_operations(&filter);
    assert_eq!(summary.cancelled, vec![format!("resilient.{file}")]);
    assert!(registry.is_empty());
    assert_eq!(admin.stats().counter(Counter::OperationsAborted), 1);
}

#[tokio::test]
async fn test_substituted_source_used_for_cleared_file() {
    let harness = Harness::four_pools(4, 4);
    let file = harness.add_file("0009", &["p1", "p2", "p3"]);
    let registry = Arc::clone(harness.service.context().registry());

    // Created when p4 lost its replica; the last copy read from p1.
    let op = FileReplicaOperation::new(file.clone(), "resilient", Some("p4".into()), EventKind::FileCleared).shared();
    registry.register(Arc::clone(&op)).unwrap();
    registry.record_verification(&op, BTreeSet::from(["p1", "p2", "p3"].map(String::from)), -1);
    op.update_state(|s| s.copy_source = Some("p1".into()));

    harness.namespace.remove_location(&file, "p1");
    let cleared = Envelope::new(ResilienceEvent::LocationCleared {
        file_id: file.clone(),
        pool: "p1".into(),
    });
    assert!(harness.service.dispatch(cleared).unwrap());

    let replaced = registry.get(&operation_key("resilient", &file)).unwrap();
    assert!(!Arc::ptr_eq(&replaced, &op));
    let new_source = replaced.source().unwrap().to_string();
    assert!(["p2", "p3"].contains(&new_source.as_str()));

    assert!(harness.settle(&file, 4).await, "file never reached four replicas");
    let copies = harness.pools.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].request.source, new_source);
    assert_eq!(copies[0].request.count, 2);
}
