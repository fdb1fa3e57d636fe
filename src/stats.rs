//! Engine statistics.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;

use crate::scheduler::TaskCategory;

/// Named counters kept by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Counter {
    /// Inbound events that passed the guard.
    EventsAccepted,
    /// Inbound events carrying our own session tag.
    EventsRejectedSelf,
    /// Inbound events dropped during warm-up or while disabled.
    EventsRejectedGate,
    /// Operations inserted into the registry.
    OperationsRegistered,
    /// Operations removed because their need was met.
    OperationsSatisfied,
    /// Operations removed for any other reason.
    OperationsAborted,
    /// Operations replaced after losing their source.
    SourcesReplaced,
    /// Copy requests issued.
    CopiesRequested,
    /// Replicas removed by reduce tasks and corrupt-replica cleanup.
    ReplicasRemoved,
    /// Pool scans completed.
    ScansCompleted,
    /// Files returned by pool scans.
    FilesScanned,
    /// Collaborator calls that timed out or failed transiently.
    TransientFailures,
    /// Alarms raised.
    AlarmsRaised,
    /// Invariant violations detected.
    Bugs,
}

impl Counter {
    /// Stable counter name.
    pub fn name(self) -> &'static str {
        match self {
            Counter::EventsAccepted => "events_accepted",
            Counter::EventsRejectedSelf => "events_rejected_self",
            Counter::EventsRejectedGate => "events_rejected_gate",
            Counter::OperationsRegistered => "operations_registered",
            Counter::OperationsSatisfied => "operations_satisfied",
            Counter::OperationsAborted => "operations_aborted",
            Counter::SourcesReplaced => "sources_replaced",
            Counter::CopiesRequested => "copies_requested",
            Counter::ReplicasRemoved => "replicas_removed",
            Counter::ScansCompleted => "scans_completed",
            Counter::FilesScanned => "files_scanned",
            Counter::TransientFailures => "transient_failures",
            Counter::AlarmsRaised => "alarms_raised",
            Counter::Bugs => "bugs",
        }
    }
}

/// Point-in-time copy of the statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Counter values by name.
    pub counters: BTreeMap<String, u64>,
    /// Task submissions by pool group, then category.
    pub submissions: BTreeMap<String, BTreeMap<String, u64>>,
    /// Operations currently registered.
    pub registered_operations: usize,
}

impl StatsSnapshot {
    /// Value of a counter, zero if never bumped.
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.get(counter.name()).copied().unwrap_or(0)
    }

    /// Submissions for one group and category.
    pub fn submitted(&self, group: &str, category: TaskCategory) -> u64 {
        self.submissions.get(group).and_then(|c| c.get(category.name())).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    counters: BTreeMap<Counter, u64>,
    submissions: BTreeMap<(String, TaskCategory), u64>,
}

/// Shared statistics collector.
#[derive(Debug, Default)]
pub struct ResilienceStats {
    inner: Mutex<StatsInner>,
}

impl ResilienceStats {
    /// Increment a counter by one.
    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Increment a counter by `n`.
    pub fn add(&self, counter: Counter, n: u64) {
        let mut inner = self.inner.lock();
        let value = inner.counters.entry(counter).or_default();
        *value = value.saturating_add(n);
    }

    /// Record a task submission.
    pub fn record_submission(&self, group: &str, category: TaskCategory) {
        let mut inner = self.inner.lock();
        let value = inner.submissions.entry((group.to_string(), category)).or_default();
        *value = value.saturating_add(1);
    }

    /// Current value of a counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.lock().counters.get(&counter).copied().unwrap_or(0)
    }

    /// Copy out every value.
    pub fn snapshot(&self, registered_operations: usize) -> StatsSnapshot {
        let inner = self.inner.lock();
        let counters = inner.counters.iter().map(|(c, v)| (c.name().to_string(), *v)).collect();
        let mut submissions: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for ((group, category), value) in &inner.submissions {
            submissions.entry(group.clone()).or_default().insert(category.name().to_string(), *value);
        }
        StatsSnapshot {
            counters,
            submissions,
            registered_operations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_by_name() {
        let stats = ResilienceStats::default();
        stats.incr(Counter::CopiesRequested);
        stats.add(Counter::CopiesRequested, 2);
        stats.record_submission("resilient", TaskCategory::Verify);
        stats.record_submission("resilient", TaskCategory::Verify);

        let snapshot = stats.snapshot(4);
        assert_eq!(snapshot.counter(Counter::CopiesRequested), 3);
        assert_eq!(snapshot.counter(Counter::Bugs), 0);
        assert_eq!(snapshot.submitted("resilient", TaskCategory::Verify), 2);
        assert_eq!(snapshot.submitted("resilient", TaskCategory::Scan), 0);
        assert_eq!(snapshot.registered_operations, 4);
    }
}
