//! Pool status and group membership events.

mod common;

use std::time::Duration;

use aspen_resilience::Envelope;
use aspen_resilience::ResilienceEvent;
use aspen_resilience::router::MembershipChange;
use aspen_resilience::types::PoolStatus;
use common::Harness;

fn status(pool: &str, status: PoolStatus) -> Envelope {
    Envelope::new(ResilienceEvent::PoolStatusChanged {
        pool: pool.into(),
        status,
    })
}

#[tokio::test(start_paused = true)]
async fn test_pool_down_rebuilds_replicas_after_grace() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0001", &["p1", "p2"]);

    assert!(harness.service.dispatch(status("p2", PoolStatus::Down)).unwrap());
    assert_eq!(harness.service.router().pending_down_scans(), 1);
    assert!(harness.namespace.scan_log().is_empty());

    // The replica on the down pool is not counted, so a third one is made.
    assert!(harness.settle(&file, 3).await);
    // The fired timer no longer counts as pending.
    assert_eq!(harness.service.router().pending_down_scans(), 0);
    let copies = harness.pools.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].request.source, "p1");
    assert!(copies[0].request.exclude_pools.contains("p2"));
}

#[tokio::test(start_paused = true)]
async fn test_pool_back_within_grace_is_not_scanned() {
    let harness = Harness::four_pools(2, 2);
    harness.add_file("0002", &["p1", "p2"]);

    assert!(harness.service.dispatch(status("p2", PoolStatus::Down)).unwrap());
    assert!(harness.service.dispatch(status("p2", PoolStatus::Up)).unwrap());
    assert_eq!(harness.service.router().pending_down_scans(), 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(harness.namespace.scan_log().is_empty());
    assert!(harness.pools.copies().is_empty());
}

#[tokio::test]
async fn test_restarted_pool_is_scanned() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0003", &["p3"]);

    assert!(harness.service.dispatch(status("p3", PoolStatus::Restart)).unwrap());
    assert!(harness.settle(&file, 2).await);
    assert!(harness.namespace.scan_log().contains(&aspen_resilience::testing::ScanLogEntry::Started("p3".into())));
}

#[tokio::test]
async fn test_pool_leaving_group_triggers_replacement() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0004", &["p1", "p4"]);

    let envelope = Envelope::new(ResilienceEvent::PoolGroupMembership {
        pool: "p4".into(),
        group: "resilient".into(),
        change: MembershipChange::Removed,
    });
    assert!(harness.service.dispatch(envelope).unwrap());
    assert!(harness.settle(&file, 3).await);

    let view = harness.service.context().topology().snapshot().group_view("resilient").unwrap();
    assert!(!view.pools.contains("p4"));
    assert!(!harness.pools.copies()[0].targets.contains(&"p4".to_string()));
}
