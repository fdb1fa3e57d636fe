//! Shared harness for engine integration tests.
//!
//! Wires a [`ResilienceService`] to the in-memory namespace, pools and
//! migration engine, with the event channel drained by the service.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use aspen_resilience::Envelope;
use aspen_resilience::FileId;
use aspen_resilience::PoolTopology;
use aspen_resilience::ResilienceConfig;
use aspen_resilience::ResilienceEvent;
use aspen_resilience::ResilienceService;
use aspen_resilience::testing::InMemoryNamespace;
use aspen_resilience::testing::InMemoryPools;
use aspen_resilience::testing::RecordingAlarmSink;
use aspen_resilience::testing::group_topology;
use aspen_resilience::testing::test_config;
use aspen_resilience::testing::wait_until;
use aspen_resilience::types::FileAttributes;

/// Upper bound on any convergence wait.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Four pools on four hosts.
pub const FOUR_POOLS: [(&str, &str); 4] = [("p1", "h1"), ("p2", "h2"), ("p3", "h3"), ("p4", "h4")];

/// An engine over simulated collaborators.
pub struct Harness {
    pub service: Arc<ResilienceService>,
    pub namespace: Arc<InMemoryNamespace>,
    pub pools: Arc<InMemoryPools>,
    pub alarms: Arc<RecordingAlarmSink>,
}

impl Harness {
    /// Engine over `topology` with `config`, events flowing.
    pub fn new(topology: PoolTopology, config: ResilienceConfig) -> Self {
        Self::with_namespace(topology, config, Arc::new(InMemoryNamespace::default()))
    }

    /// Engine over an existing namespace.
    pub fn with_namespace(topology: PoolTopology, config: ResilienceConfig, namespace: Arc<InMemoryNamespace>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let pools = Arc::new(InMemoryPools::new(Arc::clone(&namespace), topology.clone(), tx));
        let alarms = RecordingAlarmSink::shared();
        let service = Arc::new(
            ResilienceService::new(config, topology, namespace.clone(), pools.clone(), alarms.clone())
                .expect("valid configuration"),
        );
        service.run_events(rx);
        Self {
            service,
            namespace,
            pools,
            alarms,
        }
    }

    /// One resilient group over [`FOUR_POOLS`] with bounds `minimum..maximum`.
    pub fn four_pools(minimum: u32, maximum: u32) -> Self {
        Self::new(group_topology(&FOUR_POOLS, minimum, maximum), test_config())
    }

    /// Add an online file with replicas on `locations`.
    pub fn add_file(&self, id: &str, locations: &[&str]) -> FileId {
        let file_id = FileId::new(id);
        self.namespace.add_file(FileAttributes::online(file_id.clone()), locations.iter().copied());
        file_id
    }

    /// Deliver an untagged location-added event.
    pub fn location_added(&self, file_id: &FileId, pool: &str) -> bool {
        self.service
            .dispatch(Envelope::new(ResilienceEvent::LocationAdded {
                file_id: file_id.clone(),
                pool: pool.to_string(),
            }))
            .expect("dispatch")
    }

    /// Wait until the registry is empty and `file_id` has `count` replicas.
    pub async fn settle(&self, file_id: &FileId, count: usize) -> bool {
        let registry = Arc::clone(self.service.context().registry());
        wait_until(TEST_TIMEOUT, || registry.is_empty() && self.namespace.locations(file_id).len() == count).await
    }
}
