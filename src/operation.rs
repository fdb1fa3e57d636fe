//! Per-file replica operations.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::OPERATION_KEY_SEPARATOR;
use crate::types::EventKind;
use crate::types::FileId;
use crate::types::OperationMode;
use crate::verified::OperationState;

/// Registry key for a (pool group, file) pair: `"{group}.{file_id}"`.
///
/// Any component can rebuild the key from the raw pair to test registration
/// or cancel an operation without holding the operation itself.
pub fn operation_key(group: &str, file_id: &FileId) -> String {
    format!("{group}{OPERATION_KEY_SEPARATOR}{file_id}")
}

/// One file under active replica management in one pool group.
///
/// Identity fields are immutable. The mutable [`OperationState`] sits
/// behind the operation's own lock, finer than the registry lock, so that
/// acknowledgements for one file do not serialize against other keys.
#[derive(Debug)]
pub struct FileReplicaOperation {
    file_id: FileId,
    pool_group: String,
    source: Option<String>,
    kind: EventKind,
    created_at: DateTime<Utc>,
    excluded_pools: BTreeSet<String>,
    state: Mutex<OperationState>,
}

impl FileReplicaOperation {
    /// Create an unverified operation.
    pub fn new(file_id: FileId, pool_group: impl Into<String>, source: Option<String>, kind: EventKind) -> Self {
        Self {
            file_id,
            pool_group: pool_group.into(),
            source,
            kind,
            created_at: Utc::now(),
            excluded_pools: BTreeSet::new(),
            state: Mutex::new(OperationState::default()),
        }
    }

    /// Pools whose replicas must not be counted (down pool, corrupt copy).
    pub fn with_excluded(mut self, excluded: BTreeSet<String>) -> Self {
        self.excluded_pools = excluded;
        self
    }

    /// Wrap in an `Arc` for registration.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Clone this operation with a new source and state.
    ///
    /// The clone has the same key but a distinct identity; in-flight tasks
    /// holding the old object can detect that they were superseded.
    pub fn with_source(&self, source: String, state: OperationState) -> Self {
        Self {
            file_id: self.file_id.clone(),
            pool_group: self.pool_group.clone(),
            source: Some(source),
            kind: self.kind,
            created_at: self.created_at,
            excluded_pools: self.excluded_pools.clone(),
            state: Mutex::new(state),
        }
    }

    /// Registry key.
    pub fn key(&self) -> String {
        operation_key(&self.pool_group, &self.file_id)
    }

    /// File identifier.
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Owning pool group.
    pub fn pool_group(&self) -> &str {
        &self.pool_group
    }

    /// Pool that triggered the operation.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Event kind that created the operation.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Pools excluded from counting.
    pub fn excluded_pools(&self) -> &BTreeSet<String> {
        &self.excluded_pools
    }

    /// Copy of the current state.
    pub fn state(&self) -> OperationState {
        self.state.lock().clone()
    }

    /// Replace the state.
    pub fn set_state(&self, state: OperationState) {
        *self.state.lock() = state;
    }

    /// Mutate the state under the operation lock.
    pub fn update_state<T>(&self, f: impl FnOnce(&mut OperationState) -> T) -> T {
        f(&mut self.state.lock())
    }

    /// Derived mode.
    pub fn mode(&self) -> OperationMode {
        self.state.lock().mode()
    }

    /// Signed replica delta.
    pub fn replica_delta(&self) -> i64 {
        self.state.lock().replica_delta
    }

    /// Defensive copy of the known locations.
    pub fn known_locations(&self) -> BTreeSet<String> {
        self.state.lock().known_locations.clone()
    }

    /// Whether `pool` is believed to hold a replica.
    pub fn has_replica(&self, pool: &str) -> bool {
        self.state.lock().known_locations.contains(pool)
    }

    /// Add a known location; returns true if it was new.
    pub fn add_location(&self, pool: &str) -> bool {
        self.state.lock().known_locations.insert(pool.to_string())
    }

    /// Remove a known location; returns true if it was present.
    pub fn remove_location(&self, pool: &str) -> bool {
        self.state.lock().known_locations.remove(pool)
    }

    /// Whether the outstanding need has been met.
    pub fn is_satisfied(&self) -> bool {
        self.state.lock().is_satisfied()
    }

    /// Source a copy should use: the one chosen by the last copy, else the trigger.
    pub fn effective_source(&self) -> Option<String> {
        let state = self.state.lock();
        state.copy_source.clone().or_else(|| self.source.clone())
    }

    /// Flag a retryable failure.
    pub fn mark_stalled(&self) {
        self.state.lock().stalled = true;
    }

    /// Whether a retryable failure is pending.
    pub fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    /// Serializable summary.
    pub fn info(&self) -> OperationInfo {
        let state = self.state();
        OperationInfo {
            key: self.key(),
            file_id: self.file_id.clone(),
            pool_group: self.pool_group.clone(),
            source: self.source.clone(),
            kind: self.kind,
            mode: state.mode(),
            created_at: self.created_at,
            excluded_pools: self.excluded_pools.clone(),
            state,
        }
    }
}

/// Serializable snapshot of an operation, for listings and checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    /// Registry key.
    pub key: String,
    /// File identifier.
    pub file_id: FileId,
    /// Owning pool group.
    pub pool_group: String,
    /// Triggering pool.
    pub source: Option<String>,
    /// Creating event kind.
    pub kind: EventKind,
    /// Derived mode.
    pub mode: OperationMode,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Pools excluded from counting.
    #[serde(default)]
    pub excluded_pools: BTreeSet<String>,
    /// State at snapshot time.
    pub state: OperationState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_reconstructible() {
        let op = FileReplicaOperation::new(FileId::new("0000ABCD"), "resilient", Some("p1".into()), EventKind::FileAdded);
        assert_eq!(op.key(), "resilient.0000ABCD");
        assert_eq!(op.key(), operation_key("resilient", &FileId::new("0000ABCD")));
    }

    #[test]
    fn test_known_locations_are_copies() {
        let op = FileReplicaOperation::new(FileId::new("f"), "g", None, EventKind::Scan);
        assert!(op.add_location("p1"));
        assert!(!op.add_location("p1"));

        let mut copy = op.known_locations();
        copy.insert("p2".into());
        assert!(!op.has_replica("p2"));
        assert!(op.remove_location("p1"));
    }

    #[test]
    fn test_clone_with_source_keeps_key() {
        let op = FileReplicaOperation::new(FileId::new("f"), "g", Some("a".into()), EventKind::FileCleared).shared();
        let clone = Arc::new(op.with_source("b".into(), OperationState::default()));

        assert_eq!(op.key(), clone.key());
        assert!(!Arc::ptr_eq(&op, &clone));
        assert_eq!(clone.source(), Some("b"));
        assert_eq!(clone.created_at(), op.created_at());
    }

    #[test]
    fn test_effective_source_prefers_copy_source() {
        let op = FileReplicaOperation::new(FileId::new("f"), "g", Some("a".into()), EventKind::FileAdded);
        assert_eq!(op.effective_source().as_deref(), Some("a"));
        op.update_state(|s| s.copy_source = Some("b".into()));
        assert_eq!(op.effective_source().as_deref(), Some("b"));
    }
}
