//! Collaborator traits consumed by the engine.
//!
//! The namespace, the pools (with their migration engine) and the alarm
//! channel live outside this crate. The engine only talks to them through
//! these traits, and every round-trip goes through [`with_timeout`] so a
//! stuck collaborator cannot wedge a worker.
//!
//! ## Architecture
//!
//! ```text
//! tasks::{verify, replicate, reduce, scan}
//!     |
//!     +-> NamespaceClient  (attributes, locations, clear-location, scan query)
//!     +-> PoolClient       (sticky check, remove replica, bulk copy)
//!     +-> AlarmSink        (operator alarms)
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::timeout;
use tracing::error;

use crate::error::ResilienceError;
use crate::error::Result;
use crate::guard::SessionTag;
use crate::types::FileAttributes;
use crate::types::FileId;

/// Which files a pool scan selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Files with fewer than `minimum` counted replicas.
    Deficient,
    /// Files with more than `maximum` counted replicas.
    Excessive,
    /// Files outside `[minimum, maximum]`.
    Full,
}

impl ScanKind {
    /// Whether a file with `count` counted replicas is selected.
    pub fn selects(self, count: u32, minimum: u32, maximum: u32) -> bool {
        match self {
            ScanKind::Deficient => count < minimum,
            ScanKind::Excessive => count > maximum,
            ScanKind::Full => count < minimum || count > maximum,
        }
    }
}

/// Namespace query for the files of one pool needing adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanQuery {
    /// Pool whose files are enumerated.
    pub pool: String,
    /// Group the counts are taken against.
    pub group: String,
    /// Pools whose replicas count (active members minus exclusions).
    pub counted_pools: BTreeSet<String>,
    /// Pools excluded from counting.
    pub exclude: BTreeSet<String>,
    /// Selection.
    pub kind: ScanKind,
    /// Lower bound.
    pub minimum: u32,
    /// Upper bound.
    pub maximum: u32,
}

/// A file returned by a pool scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// File identifier.
    pub file_id: FileId,
    /// Pools holding a replica according to the namespace.
    pub locations: BTreeSet<String>,
}

/// Bulk copy request handed to the migration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    /// File to copy.
    pub file_id: FileId,
    /// Pool to copy from.
    pub source: String,
    /// Group the new replicas must land in.
    pub target_group: String,
    /// Number of new replicas.
    pub count: u32,
    /// Whether replicas may share a host.
    pub same_host_allowed: bool,
    /// Pools that already hold a replica (or must not receive one).
    pub exclude_pools: BTreeSet<String>,
    /// New replicas are durable.
    pub sticky: bool,
    /// Session tag of the issuing engine.
    pub session: SessionTag,
}

/// Outcome of a remove-replica request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The replica was removed.
    Removed,
    /// The pool did not hold the replica.
    NotFound,
}

/// Access to the file namespace.
#[async_trait]
pub trait NamespaceClient: Send + Sync + 'static {
    /// Attributes of a file. [`ResilienceError::NotFound`] if it was deleted.
    async fn file_attributes(&self, file_id: &FileId) -> Result<FileAttributes>;

    /// Pools holding a replica according to the namespace.
    async fn file_locations(&self, file_id: &FileId) -> Result<BTreeSet<String>>;

    /// Drop a stale location entry.
    async fn clear_cache_location(&self, file_id: &FileId, pool: &str, session: SessionTag) -> Result<()>;

    /// Files on `query.pool` whose counted replicas satisfy `query.kind`.
    async fn scan_pool(&self, query: &ScanQuery) -> Result<Vec<ScanEntry>>;
}

/// Access to pools and the migration engine.
#[async_trait]
pub trait PoolClient: Send + Sync + 'static {
    /// Whether `pool` holds a durable (sticky) replica.
    async fn has_sticky_replica(&self, pool: &str, file_id: &FileId) -> Result<bool>;

    /// Remove the replica on `pool`.
    async fn remove_replica(&self, pool: &str, file_id: &FileId, session: SessionTag) -> Result<RemoveOutcome>;

    /// Submit a bulk copy; returns the job identifier.
    async fn request_copy(&self, request: CopyRequest) -> Result<String>;
}

/// Alarm categories raised to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// Replicas exist but none is readable.
    InaccessibleFile,
    /// No replica exists anywhere.
    LostFile,
    /// Copy jobs kept failing.
    OperationFailed,
    /// Group bounds cannot be met.
    Configuration,
}

/// High-severity notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    /// Category.
    pub kind: AlarmKind,
    /// File concerned, if any.
    pub file_id: Option<FileId>,
    /// Pool concerned, if any.
    pub pool: Option<String>,
    /// Pool group concerned, if any.
    pub group: Option<String>,
    /// Human readable detail.
    pub message: String,
}

/// Destination of operator alarms.
pub trait AlarmSink: Send + Sync + 'static {
    /// Raise an alarm. Must not block.
    fn raise(&self, alarm: Alarm);
}

/// Alarm sink that logs at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAlarmSink;

impl AlarmSink for LoggingAlarmSink {
    fn raise(&self, alarm: Alarm) {
        error!(
            kind = ?alarm.kind,
            file = ?alarm.file_id.as_ref().map(FileId::as_str),
            pool = ?alarm.pool,
            group = ?alarm.group,
            "{}",
            alarm.message
        );
    }
}

/// Await a collaborator call, mapping an elapsed bound to [`ResilienceError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, bound: Duration, call: F) -> Result<T>
where F: Future<Output = Result<T>> {
    match timeout(bound, call).await {
        Ok(result) => result,
        Err(_) => Err(ResilienceError::Timeout {
            operation: operation.to_string(),
            timeout: bound,
        }),
    }
}
