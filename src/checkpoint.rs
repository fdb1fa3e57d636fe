//! Registry checkpoints.
//!
//! A checkpoint is one JSON object per line, one line per registered
//! operation. Only identity is saved: on restore every record re-enters
//! management and is verified afresh, so stale counts never survive a
//! restart.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::debug;
use tracing::warn;

use crate::constants::MAX_CHECKPOINT_RECORDS;
use crate::error::CheckpointFormatSnafu;
use crate::error::CheckpointIoSnafu;
use crate::error::Result;
use crate::operation::FileReplicaOperation;
use crate::registry::OperationRegistry;
use crate::types::EventKind;
use crate::types::FileId;

/// One checkpointed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// File.
    pub file_id: FileId,
    /// Pool group.
    pub pool_group: String,
    /// Triggering pool.
    #[serde(default)]
    pub source: Option<String>,
    /// Creating event kind.
    pub kind: EventKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Pools excluded from counting.
    #[serde(default)]
    pub excluded_pools: BTreeSet<String>,
}

impl From<&FileReplicaOperation> for OperationRecord {
    fn from(op: &FileReplicaOperation) -> Self {
        Self {
            file_id: op.file_id().clone(),
            pool_group: op.pool_group().to_string(),
            source: op.source().map(str::to_string),
            kind: op.kind(),
            created_at: op.created_at(),
            excluded_pools: op.excluded_pools().clone(),
        }
    }
}

/// Write every registered operation to `path`, atomically replacing it.
///
/// Returns the number of records written.
pub fn write_checkpoint(registry: &OperationRegistry, path: &Path) -> Result<usize> {
    let mut records: Vec<OperationRecord> = registry.snapshot().iter().map(|op| OperationRecord::from(&**op)).collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let tmp = temp_path(path);
    let file = File::create(&tmp).context(CheckpointIoSnafu { path: tmp.clone() })?;
    let mut writer = BufWriter::new(file);
    for record in &records {
        serde_json::to_writer(&mut writer, record).context(CheckpointFormatSnafu)?;
        writer.write_all(b"\n").context(CheckpointIoSnafu { path: tmp.clone() })?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error()).context(CheckpointIoSnafu { path: tmp.clone() })?;
    file.sync_all().context(CheckpointIoSnafu { path: tmp.clone() })?;
    std::fs::rename(&tmp, path).context(CheckpointIoSnafu { path: path.to_path_buf() })?;

    debug!(path = %path.display(), records = records.len(), "checkpoint written");
    Ok(records.len())
}

/// Read a checkpoint. A missing file is an empty checkpoint; malformed
/// lines are logged and skipped.
pub fn read_checkpoint(path: &Path) -> Result<Vec<OperationRecord>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context(CheckpointIoSnafu { path: path.to_path_buf() }),
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context(CheckpointIoSnafu { path: path.to_path_buf() })?;
        if line.trim().is_empty() {
            continue;
        }
        if records.len() >= MAX_CHECKPOINT_RECORDS {
            warn!(path = %path.display(), limit = MAX_CHECKPOINT_RECORDS, "checkpoint truncated");
            break;
        }
        match serde_json::from_str::<OperationRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), line = index + 1, error = %e, "skipping malformed checkpoint record"),
        }
    }
    Ok(records)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verified::TransitionPolicy;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.jsonl");

        let registry = OperationRegistry::new(TransitionPolicy { max_job_retries: 1 });
        let op = FileReplicaOperation::new(FileId::new("f1"), "resilient", Some("p1".into()), EventKind::FileAdded)
            .with_excluded(BTreeSet::from(["p9".to_string()]))
            .shared();
        registry.register(op).unwrap();
        registry
            .register(FileReplicaOperation::new(FileId::new("f2"), "resilient", None, EventKind::Scan).shared())
            .unwrap();

        assert_eq!(write_checkpoint(&registry, &path).unwrap(), 2);
        assert!(!temp_path(&path).exists());

        let records = read_checkpoint(&path).unwrap();
        assert_eq!(records.len(), 2);
        let f1 = records.iter().find(|r| r.file_id == FileId::new("f1")).unwrap();
        assert_eq!(f1.source.as_deref(), Some("p1"));
        assert!(f1.excluded_pools.contains("p9"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_checkpoint(&dir.path().join("absent.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.jsonl");
        let good = r#"{"file_id":"f1","pool_group":"g","kind":"scan","created_at":"2024-05-01T00:00:00Z"}"#;
        std::fs::write(&path, format!("{good}\nnot json\n\n{good}\n")).unwrap();

        let records = read_checkpoint(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pool_group, "g");
        assert!(records[0].source.is_none());
    }
}
