//! Registry of in-flight file operations.
//!
//! Holds at most one [`FileReplicaOperation`] per `"{group}.{file_id}"` key.
//! Every map access happens under a single lock; the per-key state machine
//! lives in [`crate::verified::apply_transition`] and the registry only
//! applies the [`Decision`] it returns.
//!
//! # Lock order
//!
//! Registry lock, then operation lock. No lock is held across an `.await`.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tracing::error;

use crate::error::ResilienceError;
use crate::error::Result;
use crate::operation::FileReplicaOperation;
use crate::operation::OperationInfo;
use crate::operation::operation_key;
use crate::types::FileId;
use crate::types::JobStatus;
use crate::types::OperationMode;
use crate::verified::Decision;
use crate::verified::RemovalReason;
use crate::verified::TransitionEvent;
use crate::verified::TransitionPolicy;
use crate::verified::apply_transition;

/// Result of [`OperationRegistry::register_if_absent`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// The operation was inserted.
    Registered(Arc<FileReplicaOperation>),
    /// Another operation already holds the key.
    Existing(Arc<FileReplicaOperation>),
}

/// Result of applying an event to the registry.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// No operation holds the key.
    NotRegistered,
    /// The entry was updated in place.
    Kept(Arc<FileReplicaOperation>),
    /// The entry was replaced by a clone with a new source; resubmit a copy for `new`.
    Replaced {
        /// Superseded operation.
        old: Arc<FileReplicaOperation>,
        /// Operation now registered under the same key.
        new: Arc<FileReplicaOperation>,
    },
    /// The entry was removed.
    Removed {
        /// Removed operation.
        op: Arc<FileReplicaOperation>,
        /// Why it was removed.
        reason: RemovalReason,
    },
    /// The entry was reset; resubmit a verification.
    Resubmit(Arc<FileReplicaOperation>),
}

/// Result of recording a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The operation was replaced or removed meanwhile.
    Superseded,
    /// Delta was zero; the operation was unregistered.
    Satisfied,
    /// More copies are needed.
    Replicate,
    /// Copies must be removed.
    Reduce,
}

/// Filter for listing or cancelling operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    /// Only operations whose source or known locations include this pool.
    pub pool: Option<String>,
    /// Only operations for this file.
    pub file_id: Option<FileId>,
    /// Only operations in this pool group.
    pub pool_group: Option<String>,
    /// Only operations in this mode.
    pub mode: Option<OperationMode>,
    /// Only operations created at or after this time.
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    /// Only operations created at or before this time.
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
}

impl OperationFilter {
    /// Whether `op` passes every set criterion.
    pub fn matches(&self, op: &FileReplicaOperation) -> bool {
        if let Some(pool) = &self.pool {
            if op.source() != Some(pool.as_str()) && !op.has_replica(pool) {
                return false;
            }
        }
        if self.file_id.as_ref().is_some_and(|f| f != op.file_id()) {
            return false;
        }
        if self.pool_group.as_deref().is_some_and(|g| g != op.pool_group()) {
            return false;
        }
        if self.mode.is_some_and(|m| m != op.mode()) {
            return false;
        }
        if self.created_after.is_some_and(|t| op.created_at() < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| op.created_at() > t) {
            return false;
        }
        true
    }
}

/// In-memory registry of in-flight operations.
#[derive(Debug)]
pub struct OperationRegistry {
    operations: Mutex<HashMap<String, Arc<FileReplicaOperation>>>,
    policy: TransitionPolicy,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new(policy: TransitionPolicy) -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Insert `op` at its key.
    ///
    /// Registering the same operation twice is a no-op. Registering a
    /// different operation under an occupied key is a caller bug.
    pub fn register(&self, op: Arc<FileReplicaOperation>) -> Result<()> {
        let key = op.key();
        let mut operations = self.operations.lock();
        if let Some(existing) = operations.get(&key) {
            if Arc::ptr_eq(existing, &op) {
                return Ok(());
            }
            return Err(ResilienceError::bug(format!("operation {key} registered twice without removal")));
        }
        operations.insert(key, op);
        Ok(())
    }

    /// Insert `op` unless its key is taken; atomic with respect to other callers.
    pub fn register_if_absent(&self, op: Arc<FileReplicaOperation>) -> Registration {
        let key = op.key();
        let mut operations = self.operations.lock();
        match operations.get(&key) {
            Some(existing) => Registration::Existing(Arc::clone(existing)),
            None => {
                operations.insert(key, Arc::clone(&op));
                Registration::Registered(op)
            }
        }
    }

    /// Whether an operation holds `op`'s key.
    pub fn is_registered(&self, op: &FileReplicaOperation) -> bool {
        self.operations.lock().contains_key(&op.key())
    }

    /// Whether an operation holds the key of (group, file).
    pub fn is_registered_key(&self, group: &str, file_id: &FileId) -> bool {
        self.operations.lock().contains_key(&operation_key(group, file_id))
    }

    /// Whether `op` itself (not a replacement) is registered.
    pub fn is_current(&self, op: &Arc<FileReplicaOperation>) -> bool {
        self.operations.lock().get(&op.key()).is_some_and(|current| Arc::ptr_eq(current, op))
    }

    /// Operation registered at `key`.
    pub fn get(&self, key: &str) -> Option<Arc<FileReplicaOperation>> {
        self.operations.lock().get(key).cloned()
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }

    /// Apply an event to the operation at `key`.
    pub fn update(&self, key: &str, event: &TransitionEvent) -> Result<UpdateOutcome> {
        let mut operations = self.operations.lock();
        let Some(op) = operations.get(key).cloned() else {
            return Ok(UpdateOutcome::NotRegistered);
        };

        let mut rng = rand::rng();
        let (decision, new_state) = op.update_state(|state| {
            let source = state.copy_source.clone().or_else(|| op.source().map(str::to_string));
            let transition = apply_transition(state, source.as_deref(), event, &self.policy, &mut rng)?;
            *state = transition.state.clone();
            Ok::<_, ResilienceError>((transition.decision, transition.state))
        })
        .inspect_err(|e| error!(key, error = %e, "registry update rejected"))?;

        let outcome = match decision {
            Decision::Keep => UpdateOutcome::Kept(op),
            Decision::Resubmit => UpdateOutcome::Resubmit(op),
            Decision::Remove(reason) => {
                operations.remove(key);
                debug!(key, ?reason, "operation removed");
                UpdateOutcome::Removed { op, reason }
            }
            Decision::Replace { new_source } => {
                let new = Arc::new(op.with_source(new_source, new_state));
                operations.insert(key.to_string(), Arc::clone(&new));
                debug!(key, source = ?new.source(), "operation replaced with new source");
                UpdateOutcome::Replaced { old: op, new }
            }
        };
        Ok(outcome)
    }

    /// Apply a copy job status notification.
    pub fn update_status(&self, status: &JobStatus) -> Result<UpdateOutcome> {
        let event = TransitionEvent::Acknowledged {
            outcome: status.outcome,
            pool: status.pool.clone(),
        };
        self.update(&operation_key(&status.pool_group, &status.file_id), &event)
    }

    /// Record that a reduce request removed the replica on `pool`.
    pub fn apply_removal(&self, op: &Arc<FileReplicaOperation>, pool: &str) -> Result<UpdateOutcome> {
        if !self.is_current(op) {
            return Ok(UpdateOutcome::NotRegistered);
        }
        self.update(&op.key(), &TransitionEvent::ReplicaRemoved { pool: pool.to_string() })
    }

    /// Store a verification result and unregister if nothing needs doing.
    pub fn record_verification(
        &self,
        op: &Arc<FileReplicaOperation>,
        known_locations: BTreeSet<String>,
        delta: i64,
    ) -> VerificationOutcome {
        let key = op.key();
        let mut operations = self.operations.lock();
        if !operations.get(&key).is_some_and(|current| Arc::ptr_eq(current, op)) {
            return VerificationOutcome::Superseded;
        }
        let mode = op.update_state(|state| {
            state.record_verification(known_locations, delta);
            state.mode()
        });
        match mode {
            OperationMode::None => {
                operations.remove(&key);
                VerificationOutcome::Satisfied
            }
            OperationMode::Replicate => VerificationOutcome::Replicate,
            OperationMode::Reduce => VerificationOutcome::Reduce,
        }
    }

    /// Remove `op` if it is still the registered operation for its key.
    pub fn unregister(&self, op: &Arc<FileReplicaOperation>) -> bool {
        let key = op.key();
        let mut operations = self.operations.lock();
        if operations.get(&key).is_some_and(|current| Arc::ptr_eq(current, op)) {
            operations.remove(&key);
            true
        } else {
            false
        }
    }

    /// Remove whatever is registered at `key`.
    pub fn remove(&self, key: &str) -> Option<Arc<FileReplicaOperation>> {
        self.operations.lock().remove(key)
    }

    /// Remove every operation, returning how many were removed.
    pub fn remove_all(&self) -> usize {
        let mut operations = self.operations.lock();
        let n = operations.len();
        operations.clear();
        n
    }

    /// Remove every operation matching `predicate`.
    pub fn remove_matching<F>(&self, predicate: F) -> Vec<Arc<FileReplicaOperation>>
    where F: Fn(&FileReplicaOperation) -> bool {
        let mut operations = self.operations.lock();
        let keys: Vec<String> = operations.iter().filter(|(_, op)| predicate(op)).map(|(k, _)| k.clone()).collect();
        keys.into_iter().filter_map(|k| operations.remove(&k)).collect()
    }

    /// Source pools and files of all operations currently in `mode`.
    pub fn partition(&self, mode: OperationMode) -> (BTreeSet<String>, BTreeSet<FileId>) {
        let operations = self.operations.lock();
        let mut pools = BTreeSet::new();
        let mut files = BTreeSet::new();
        for op in operations.values().filter(|op| op.mode() == mode) {
            if let Some(source) = op.source() {
                pools.insert(source.to_string());
            }
            files.insert(op.file_id().clone());
        }
        (pools, files)
    }

    /// Source pools of operations with work in flight.
    ///
    /// Stalled operations are left out: nothing is running for them, and a
    /// scan of their source pool is what retriggers them.
    pub fn busy_source_pools(&self) -> BTreeSet<String> {
        self.operations
            .lock()
            .values()
            .filter(|op| !op.is_stalled())
            .filter_map(|op| op.source().map(str::to_string))
            .collect()
    }

    /// Snapshot of all registered operations.
    pub fn snapshot(&self) -> Vec<Arc<FileReplicaOperation>> {
        self.operations.lock().values().cloned().collect()
    }

    /// Summaries of operations passing `filter`, oldest first.
    pub fn list(&self, filter: &OperationFilter) -> Vec<OperationInfo> {
        let mut infos: Vec<OperationInfo> =
            self.snapshot().iter().filter(|op| filter.matches(op)).map(|op| op.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        infos
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::types::EventKind;
    use crate::types::JobOutcome;
    use crate::verified::compute_replica_delta;

    fn registry() -> OperationRegistry {
        OperationRegistry::new(TransitionPolicy { max_job_retries: 1 })
    }

    fn op(file: &str, source: &str) -> Arc<FileReplicaOperation> {
        FileReplicaOperation::new(FileId::new(file), "resilient", Some(source.into()), EventKind::FileAdded).shared()
    }

    fn locations(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_is_idempotent_for_same_operation() {
        let registry = registry();
        let a = op("f1", "p1");
        registry.register(Arc::clone(&a)).unwrap();
        registry.register(Arc::clone(&a)).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_duplicate_key_is_a_bug() {
        let registry = registry();
        registry.register(op("f1", "p1")).unwrap();
        let err = registry.register(op("f1", "p2")).unwrap_err();
        assert!(matches!(err, ResilienceError::Bug { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_registration_keeps_one() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || matches!(registry.register_if_absent(op("f1", &format!("p{i}"))), Registration::Registered(_)))
            })
            .collect();
        let registered = handles.into_iter().map(|h| h.join().unwrap()).filter(|r| *r).count();
        assert_eq!(registered, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_registered_key("resilient", &FileId::new("f1")));
    }

    #[test]
    fn test_verification_zero_delta_unregisters() {
        let registry = registry();
        let a = op("f1", "p1");
        registry.register(Arc::clone(&a)).unwrap();
        let outcome = registry.record_verification(&a, locations(&["p1", "p2"]), 0);
        assert_eq!(outcome, VerificationOutcome::Satisfied);
        assert!(!registry.is_registered(&a));
    }

    #[test]
    fn test_satisfied_operation_removed_on_next_update() {
        let registry = registry();
        let a = op("f1", "p1");
        registry.register(Arc::clone(&a)).unwrap();
        let delta = compute_replica_delta(1, 2, 2, false);
        assert_eq!(registry.record_verification(&a, locations(&["p1"]), delta), VerificationOutcome::Replicate);

        let added = TransitionEvent::LocationAdded { pool: "p2".into() };
        let outcome = registry.update(&a.key(), &added).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Removed { reason: RemovalReason::Satisfied, .. }));
        assert!(registry.is_empty());
        assert!(matches!(registry.update(&a.key(), &added).unwrap(), UpdateOutcome::NotRegistered));
    }

    #[test]
    fn test_source_substitution_replaces_entry() {
        let registry = registry();
        let a = op("f1", "A");
        registry.register(Arc::clone(&a)).unwrap();
        let delta = compute_replica_delta(2, 3, 3, false);
        registry.record_verification(&a, locations(&["A", "B"]), delta);

        let outcome = registry.update(&a.key(), &TransitionEvent::Corrupt { pool: "A".into() }).unwrap();
        let UpdateOutcome::Replaced { old, new } = outcome else {
            panic!("expected replacement, got {outcome:?}");
        };
        assert!(Arc::ptr_eq(&old, &a));
        assert!(!Arc::ptr_eq(&new, &a));
        assert_eq!(new.key(), a.key());
        assert_eq!(new.source(), Some("B"));
        assert!(registry.is_current(&new));
        assert!(!registry.is_current(&a));
        assert!(!registry.unregister(&a), "stale operation must not remove its replacement");
    }

    #[test]
    fn test_update_status_acknowledges() {
        let registry = registry();
        let a = op("f1", "p1");
        registry.register(Arc::clone(&a)).unwrap();
        registry.record_verification(&a, locations(&["p1"]), compute_replica_delta(1, 3, 3, false));

        let status = JobStatus {
            file_id: FileId::new("f1"),
            pool_group: "resilient".into(),
            pool: Some("p2".into()),
            job_id: None,
            outcome: JobOutcome::Succeeded,
        };
        let outcome = registry.update_status(&status).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Kept(_)));
        assert_eq!(a.state().acknowledgements, 1);
        assert!(a.has_replica("p2"));
    }

    #[test]
    fn test_bug_leaves_state_untouched() {
        let registry = registry();
        let a = op("f1", "p1");
        registry.register(Arc::clone(&a)).unwrap();
        // Forge an invalid state: verified with a zero delta but still registered.
        a.update_state(|s| s.record_verification(locations(&["p1", "p2"]), 0));

        let err = registry.update(&a.key(), &TransitionEvent::LocationAdded { pool: "p3".into() }).unwrap_err();
        assert!(matches!(err, ResilienceError::Bug { .. }));
        assert_eq!(a.known_locations().len(), 2);
        assert!(registry.is_current(&a));
    }

    #[test]
    fn test_partition_and_remove_matching() {
        let registry = registry();
        let a = op("f1", "p1");
        let b = op("f2", "p2");
        registry.register(Arc::clone(&a)).unwrap();
        registry.register(Arc::clone(&b)).unwrap();
        registry.record_verification(&a, locations(&["p1"]), -1);
        registry.record_verification(&b, locations(&["p2", "p3", "p4"]), 1);

        let (pools, files) = registry.partition(OperationMode::Replicate);
        assert_eq!(pools, locations(&["p1"]));
        assert_eq!(files, BTreeSet::from([FileId::new("f1")]));

        assert_eq!(registry.busy_source_pools(), locations(&["p1", "p2"]));
        a.mark_stalled();
        assert_eq!(registry.busy_source_pools(), locations(&["p2"]));

        let removed = registry.remove_matching(|op| op.mode() == OperationMode::Reduce);
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remove_all(), 1);
    }

    #[test]
    fn test_list_with_filter() {
        let registry = registry();
        registry.register(op("f1", "p1")).unwrap();
        registry.register(op("f2", "p2")).unwrap();

        let filter = OperationFilter {
            pool: Some("p2".into()),
            ..Default::default()
        };
        let listed = registry.list(&filter);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_id, FileId::new("f2"));
        assert_eq!(registry.list(&OperationFilter::default()).len(), 2);
    }
}
