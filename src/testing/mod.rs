//! In-memory collaborators for deterministic engine tests.
//!
//! The namespace, the pools, and the migration engine are simulated in
//! process so scenarios run without a cluster and without timing
//! dependencies beyond the tokio clock.
//!
//! ## Key Components
//!
//! - `InMemoryNamespace`: file attributes, replica locations, pool scans
//! - `InMemoryPools`: sticky checks, removals, and a migration engine that
//!   writes replicas and reports job status on the event channel
//! - `RecordingAlarmSink`: keeps every alarm for assertions
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let (tx, rx) = mpsc::unbounded_channel();
//! let namespace = Arc::new(InMemoryNamespace::default());
//! let pools = Arc::new(InMemoryPools::new(Arc::clone(&namespace), sample_topology(), tx));
//! let service = ResilienceService::new(config, sample_topology(), namespace, pools, alarms)?;
//! service.run_events(rx);
//! ```
pub mod namespace;
pub mod pools;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub use namespace::InMemoryNamespace;
pub use namespace::ScanLogEntry;
pub use pools::CopyRecord;
pub use pools::InMemoryPools;

use crate::clients::Alarm;
use crate::clients::AlarmKind;
use crate::clients::AlarmSink;
use crate::config::ResilienceConfig;
use crate::topology::Link;
use crate::topology::PoolGroupConfig;
use crate::topology::PoolInfo;
use crate::topology::PoolTopology;
use crate::topology::StorageUnit;
use crate::topology::TopologyConfig;

/// Topology used across tests.
///
/// - pools `p1`..`p5` on hosts `h1`, `h2`, `h3`, `h3`, `h4`
/// - group `resilient` = `p1`..`p4`, bounds 2..3, no host sharing
/// - group `cache` = `p5`, bounds 1..1
/// - unit `exp:raw@osm`, bounds 3..3 with host sharing, linked to `resilient`
pub fn sample_topology() -> PoolTopology {
    let pools = [("p1", "h1"), ("p2", "h2"), ("p3", "h3"), ("p4", "h3"), ("p5", "h4")];
    let config = TopologyConfig {
        pools: pools.iter().map(|(name, host)| pool(name, host)).collect(),
        groups: vec![
            PoolGroupConfig {
                name: "resilient".into(),
                pools: vec!["p1".into(), "p2".into(), "p3".into(), "p4".into()],
                minimum: 2,
                maximum: 3,
                same_host_allowed: false,
            },
            PoolGroupConfig {
                name: "cache".into(),
                pools: vec!["p5".into()],
                minimum: 1,
                maximum: 1,
                same_host_allowed: false,
            },
        ],
        units: vec![StorageUnit {
            name: "exp:raw@osm".into(),
            minimum: 3,
            maximum: 3,
            same_host_allowed: true,
        }],
        links: vec![Link {
            name: "raw-link".into(),
            groups: vec!["resilient".into()],
            units: vec!["exp:raw@osm".into()],
        }],
    };
    PoolTopology::from_config(config).unwrap_or_default()
}

/// A single resilient group named `resilient` over `pools` (`(name, host)`
/// pairs) with the given bounds and no storage units.
pub fn group_topology(pools: &[(&str, &str)], minimum: u32, maximum: u32) -> PoolTopology {
    let config = TopologyConfig {
        pools: pools.iter().map(|(name, host)| pool(name, host)).collect(),
        groups: vec![PoolGroupConfig {
            name: "resilient".into(),
            pools: pools.iter().map(|(name, _)| name.to_string()).collect(),
            minimum,
            maximum,
            same_host_allowed: false,
        }],
        units: Vec::new(),
        links: Vec::new(),
    };
    PoolTopology::from_config(config).unwrap_or_default()
}

/// Configuration with no warm-up, no automatic watchdog pass, and short
/// timeouts.
pub fn test_config() -> ResilienceConfig {
    ResilienceConfig {
        startup_delay_secs: 0,
        request_timeout_ms: 2_000,
        watchdog_enabled: false,
        pool_down_grace_secs: 1,
        ..ResilienceConfig::default()
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn pool(name: &str, host: &str) -> PoolInfo {
    PoolInfo {
        name: name.to_string(),
        host: host.to_string(),
        active: true,
    }
}

/// Alarm sink that keeps every alarm.
#[derive(Debug, Default)]
pub struct RecordingAlarmSink {
    alarms: Mutex<Vec<Alarm>>,
}

impl RecordingAlarmSink {
    /// Shared empty sink.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every alarm raised so far.
    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.lock().clone()
    }

    /// Number of alarms of one kind.
    pub fn count(&self, kind: AlarmKind) -> usize {
        self.alarms.lock().iter().filter(|a| a.kind == kind).count()
    }
}

impl AlarmSink for RecordingAlarmSink {
    fn raise(&self, alarm: Alarm) {
        self.alarms.lock().push(alarm);
    }
}
