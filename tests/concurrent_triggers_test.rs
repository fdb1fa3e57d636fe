//! Concurrent triggers for the same file converge on one operation.

mod common;

use std::sync::Arc;

use aspen_resilience::Envelope;
use aspen_resilience::ResilienceEvent;
use aspen_resilience::clients::ScanKind;
use aspen_resilience::stats::Counter;
use aspen_resilience::tasks::ScanPass;
use aspen_resilience::tasks::ScanRequest;
use common::Harness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_events_request_one_copy() {
    let harness = Harness::four_pools(2, 2);
    let file = harness.add_file("0001", &["p1"]);

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let service = Arc::clone(&harness.service);
            let file = file.clone();
            tokio::spawn(async move {
                service
                    .dispatch(Envelope::new(ResilienceEvent::LocationAdded { file_id: file, pool: "p1".into() }))
                    .unwrap()
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap());
    }

    assert!(harness.settle(&file, 2).await);
    let written: usize = harness.pools.copies().iter().map(|c| c.targets.len()).sum();
    assert_eq!(written, 1);
}

#[tokio::test]
async fn test_shared_pass_visits_file_once() {
    let harness = Harness::four_pools(3, 3);
    let file = harness.add_file("0002", &["p1", "p2"]);
    let context = harness.service.context();

    let pass = ScanPass::new();
    for pool in ["p1", "p2"] {
        let handle = context.submit_scan(ScanRequest::new(pool, "resilient", ScanKind::Full), Arc::clone(&pass));
        assert!(handle.join().await);
    }

    assert_eq!(pass.visited(), 1);
    assert!(harness.settle(&file, 3).await);
    assert_eq!(harness.service.stats().counter(Counter::OperationsRegistered), 1);
    assert_eq!(harness.pools.copies().len(), 1);
}
