//! Registry checkpoints survive an engine restart.

mod common;

use std::sync::Arc;

use aspen_resilience::FileId;
use aspen_resilience::checkpoint::read_checkpoint;
use aspen_resilience::operation::FileReplicaOperation;
use aspen_resilience::testing::InMemoryNamespace;
use aspen_resilience::testing::sample_topology;
use aspen_resilience::testing::test_config;
use aspen_resilience::types::EventKind;
use aspen_resilience::types::FileAttributes;
use common::Harness;

#[tokio::test]
async fn test_restart_resumes_checkpointed_operations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("operations.jsonl");
    let mut config = test_config();
    config.checkpoint_path = Some(path.clone());

    let namespace = Arc::new(InMemoryNamespace::default());
    let deficient = FileId::new("0001");
    let cached = FileId::new("0002");
    namespace.add_file(FileAttributes::online(deficient.clone()), ["p1"]);
    namespace.add_file(FileAttributes::online(cached.clone()), ["p5"]);

    // First engine: operations registered but never run.
    {
        let first = Harness::with_namespace(sample_topology(), config.clone(), Arc::clone(&namespace));
        let registry = first.service.context().registry();
        registry
            .register(
                FileReplicaOperation::new(deficient.clone(), "resilient", Some("p1".into()), EventKind::FileAdded)
                    .shared(),
            )
            .unwrap();
        registry
            .register(FileReplicaOperation::new(cached.clone(), "cache", Some("p5".into()), EventKind::Scan).shared())
            .unwrap();
        assert_eq!(first.service.checkpoint().unwrap(), Some(2));
    }
    assert_eq!(read_checkpoint(&path).unwrap().len(), 2);

    // Second engine: only the resilient group's record comes back.
    let second = Harness::with_namespace(sample_topology(), config, Arc::clone(&namespace));
    assert_eq!(second.service.restore_checkpoint(&path).unwrap(), 1);
    assert!(second.settle(&deficient, 2).await);
    assert_eq!(namespace.locations(&cached).len(), 1);

    second.service.shutdown().await;
    assert!(read_checkpoint(&path).unwrap().is_empty());
}
