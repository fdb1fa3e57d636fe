//! Core value types shared across the resilience engine.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Opaque immutable identifier of a file in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Create a file id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The kind of event that created an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A replica appeared on a pool.
    FileAdded,
    /// A replica disappeared from a pool.
    FileCleared,
    /// The file was found by a pool scan.
    Scan,
    /// Origin unknown (operator request, checkpoint reload).
    Indeterminate,
}

/// What an operation is doing, derived from its replica delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Not yet verified, or nothing to do.
    None,
    /// More copies are needed.
    Replicate,
    /// Copies must be removed.
    Reduce,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationMode::None => "none",
            OperationMode::Replicate => "replicate",
            OperationMode::Reduce => "reduce",
        };
        f.write_str(s)
    }
}

/// Status reported for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Pool is serving.
    Up,
    /// Pool stopped serving.
    Down,
    /// Pool came back after a restart and may hold stale replicas.
    Restart,
}

/// Outcome carried by a copy job status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The job is still running.
    InProgress,
    /// A replica was written to the target pool.
    Succeeded,
    /// The target pool already held a replica.
    Exists,
    /// The copy failed.
    Failed,
    /// The copy was cancelled.
    Cancelled,
    /// The source replica turned out to be corrupt.
    Corrupt,
}

impl JobOutcome {
    /// Whether this outcome acknowledges completion of the request.
    pub fn is_acknowledgement(self) -> bool {
        !matches!(self, JobOutcome::InProgress)
    }
}

/// Status notification of a copy job issued by the migration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// File being copied.
    pub file_id: FileId,
    /// Target pool group of the copy.
    pub pool_group: String,
    /// Pool the job wrote to, or the pool found corrupt.
    pub pool: Option<String>,
    /// Job identifier, if known.
    pub job_id: Option<String>,
    /// Reported outcome.
    pub outcome: JobOutcome,
}

/// File access latency as recorded in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLatency {
    /// The file is kept on disk.
    Online,
    /// The file may be staged from tape.
    Nearline,
}

/// The subset of file attributes the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// File identifier.
    pub file_id: FileId,
    /// Access latency.
    pub access_latency: AccessLatency,
    /// Storage class, e.g. `"exp:raw"`.
    pub storage_class: Option<String>,
    /// HSM instance name, if the file is tape-backed.
    pub hsm: Option<String>,
}

impl FileAttributes {
    /// Create online attributes with no storage class.
    pub fn online(file_id: FileId) -> Self {
        Self {
            file_id,
            access_latency: AccessLatency::Online,
            storage_class: None,
            hsm: None,
        }
    }

    /// Storage unit key `storage_class[@hsm]`, if a storage class is set.
    pub fn storage_unit_key(&self) -> Option<String> {
        let class = self.storage_class.as_ref()?;
        Some(match &self.hsm {
            Some(hsm) => format!("{class}@{hsm}"),
            None => class.clone(),
        })
    }
}
