//! In-memory namespace.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clients::NamespaceClient;
use crate::clients::ScanEntry;
use crate::clients::ScanQuery;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::guard::SessionTag;
use crate::types::FileAttributes;
use crate::types::FileId;

/// One step of a pool scan, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanLogEntry {
    /// The scan of a pool began.
    Started(String),
    /// The scan of a pool returned.
    Finished(String),
}

#[derive(Debug, Clone)]
struct FileEntry {
    attributes: FileAttributes,
    locations: BTreeSet<String>,
}

/// Namespace backed by a map of files to their replica locations.
#[derive(Debug, Default)]
pub struct InMemoryNamespace {
    files: Mutex<BTreeMap<FileId, FileEntry>>,
    scan_log: Mutex<Vec<ScanLogEntry>>,
    scan_delay: Mutex<Duration>,
    clears: Mutex<Vec<(FileId, String)>>,
}

impl InMemoryNamespace {
    /// Add or replace a file with replicas on `locations`.
    pub fn add_file<'a>(&self, attributes: FileAttributes, locations: impl IntoIterator<Item = &'a str>) {
        let entry = FileEntry {
            locations: locations.into_iter().map(str::to_string).collect(),
            attributes,
        };
        self.files.lock().insert(entry.attributes.file_id.clone(), entry);
    }

    /// Delete a file.
    pub fn delete_file(&self, file_id: &FileId) {
        self.files.lock().remove(file_id);
    }

    /// Record a replica on `pool`. Returns true if it was new.
    pub fn add_location(&self, file_id: &FileId, pool: &str) -> bool {
        self.files.lock().get_mut(file_id).is_some_and(|f| f.locations.insert(pool.to_string()))
    }

    /// Forget the replica on `pool`. Returns true if it was present.
    pub fn remove_location(&self, file_id: &FileId, pool: &str) -> bool {
        self.files.lock().get_mut(file_id).is_some_and(|f| f.locations.remove(pool))
    }

    /// Current locations of a file; empty if unknown.
    pub fn locations(&self, file_id: &FileId) -> BTreeSet<String> {
        self.files.lock().get(file_id).map(|f| f.locations.clone()).unwrap_or_default()
    }

    /// Make every scan take `delay` before returning.
    pub fn set_scan_delay(&self, delay: Duration) {
        *self.scan_delay.lock() = delay;
    }

    /// Scan starts and ends, in order.
    pub fn scan_log(&self) -> Vec<ScanLogEntry> {
        self.scan_log.lock().clone()
    }

    /// Stale locations cleared through [`NamespaceClient::clear_cache_location`].
    pub fn cleared(&self) -> Vec<(FileId, String)> {
        self.clears.lock().clone()
    }
}

#[async_trait]
impl NamespaceClient for InMemoryNamespace {
    async fn file_attributes(&self, file_id: &FileId) -> Result<FileAttributes> {
        self.files
            .lock()
            .get(file_id)
            .map(|f| f.attributes.clone())
            .ok_or_else(|| ResilienceError::not_found("file", file_id.as_str()))
    }

    async fn file_locations(&self, file_id: &FileId) -> Result<BTreeSet<String>> {
        self.files
            .lock()
            .get(file_id)
            .map(|f| f.locations.clone())
            .ok_or_else(|| ResilienceError::not_found("file", file_id.as_str()))
    }

    async fn clear_cache_location(&self, file_id: &FileId, pool: &str, _session: SessionTag) -> Result<()> {
        self.remove_location(file_id, pool);
        self.clears.lock().push((file_id.clone(), pool.to_string()));
        Ok(())
    }

    async fn scan_pool(&self, query: &ScanQuery) -> Result<Vec<ScanEntry>> {
        self.scan_log.lock().push(ScanLogEntry::Started(query.pool.clone()));
        let delay = *self.scan_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let entries = self
            .files
            .lock()
            .values()
            .filter(|f| f.locations.contains(&query.pool))
            .filter(|f| {
                let counted = f.locations.iter().filter(|p| query.counted_pools.contains(*p)).count();
                query.kind.selects(u32::try_from(counted).unwrap_or(u32::MAX), query.minimum, query.maximum)
            })
            .map(|f| ScanEntry {
                file_id: f.attributes.file_id.clone(),
                locations: f.locations.clone(),
            })
            .collect();

        self.scan_log.lock().push(ScanLogEntry::Finished(query.pool.clone()));
        Ok(entries)
    }
}
