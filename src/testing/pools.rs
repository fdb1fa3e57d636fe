//! In-memory pools and migration engine.
//!
//! A copy request is carried out immediately: replicas are written into the
//! namespace and, for each one, a `LocationAdded` event and a job status are
//! sent on the event channel. Removals update the namespace and echo a
//! `LocationCleared` event tagged with the requester's session, as a real
//! pool would.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::InMemoryNamespace;
use crate::clients::CopyRequest;
use crate::clients::PoolClient;
use crate::clients::RemoveOutcome;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::guard::SessionTag;
use crate::router::Envelope;
use crate::router::ResilienceEvent;
use crate::topology::PoolTopology;
use crate::types::FileId;
use crate::types::JobOutcome;
use crate::types::JobStatus;

/// A copy request as received, plus the pools it wrote to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRecord {
    /// The request.
    pub request: CopyRequest,
    /// Job identifier returned.
    pub job_id: String,
    /// Pools that received a replica.
    pub targets: Vec<String>,
}

/// Pools and migration engine over an [`InMemoryNamespace`].
pub struct InMemoryPools {
    namespace: Arc<InMemoryNamespace>,
    topology: PoolTopology,
    events: mpsc::UnboundedSender<Envelope>,
    next_job: AtomicU64,
    failing_copies: AtomicU32,
    refused_copies: AtomicU32,
    refused_removals: AtomicU32,
    unreachable: Mutex<BTreeSet<String>>,
    volatile: Mutex<BTreeSet<(FileId, String)>>,
    copies: Mutex<Vec<CopyRecord>>,
    removals: Mutex<Vec<(FileId, String)>>,
}

impl InMemoryPools {
    /// Pools described by `topology`, reporting on `events`.
    pub fn new(
        namespace: Arc<InMemoryNamespace>,
        topology: PoolTopology,
        events: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            namespace,
            topology,
            events,
            next_job: AtomicU64::new(1),
            failing_copies: AtomicU32::new(0),
            refused_copies: AtomicU32::new(0),
            refused_removals: AtomicU32::new(0),
            unreachable: Mutex::new(BTreeSet::new()),
            volatile: Mutex::new(BTreeSet::new()),
            copies: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
        }
    }

    /// The next `n` copy jobs report failure without writing anything.
    pub fn fail_next_copies(&self, n: u32) {
        self.failing_copies.store(n, Ordering::SeqCst);
    }

    /// The next `n` copy requests are refused with a transient error; no
    /// job is created.
    pub fn refuse_next_copies(&self, n: u32) {
        self.refused_copies.store(n, Ordering::SeqCst);
    }

    /// The next `n` remove requests are refused with a transient error.
    pub fn refuse_next_removals(&self, n: u32) {
        self.refused_removals.store(n, Ordering::SeqCst);
    }

    /// Every request to `pool` fails with a transient error.
    pub fn set_unreachable(&self, pool: &str, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(pool.to_string());
        } else {
            set.remove(pool);
        }
    }

    /// The replica of `file_id` on `pool` is a cached, non-sticky copy.
    pub fn mark_volatile(&self, file_id: &FileId, pool: &str) {
        self.volatile.lock().insert((file_id.clone(), pool.to_string()));
    }

    /// Copy requests received so far.
    pub fn copies(&self) -> Vec<CopyRecord> {
        self.copies.lock().clone()
    }

    /// Removals carried out so far.
    pub fn removals(&self) -> Vec<(FileId, String)> {
        self.removals.lock().clone()
    }

    /// Total number of namespace mutations caused by the engine.
    pub fn mutations(&self) -> usize {
        let written: usize = self.copies.lock().iter().map(|c| c.targets.len()).sum();
        written + self.removals.lock().len()
    }

    fn check_reachable(&self, pool: &str) -> Result<()> {
        if self.unreachable.lock().contains(pool) {
            return Err(ResilienceError::TransientAccess {
                reason: format!("pool {pool} is not responding"),
            });
        }
        Ok(())
    }

    fn take_refusal(counter: &AtomicU32, what: &str) -> Result<()> {
        if counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(ResilienceError::TransientAccess {
                reason: format!("{what} refused, migration engine busy"),
            });
        }
        Ok(())
    }

    fn send(&self, envelope: Envelope) {
        // The engine may already be gone at the end of a test.
        let _ = self.events.send(envelope);
    }

    fn choose_targets(&self, request: &CopyRequest) -> Vec<String> {
        let Some(group) = self.topology.group(&request.target_group) else {
            return Vec::new();
        };
        let existing = self.namespace.locations(&request.file_id);
        let unreachable = self.unreachable.lock().clone();
        let mut hosts: BTreeSet<String> =
            existing.iter().filter_map(|p| self.topology.host_of(p)).map(str::to_string).collect();

        let mut targets = Vec::new();
        for pool in &group.pools {
            if targets.len() as u32 >= request.count {
                break;
            }
            if existing.contains(pool)
                || request.exclude_pools.contains(pool)
                || unreachable.contains(pool)
                || !self.topology.is_active(pool)
            {
                continue;
            }
            let host = self.topology.host_of(pool).unwrap_or_default().to_string();
            if !request.same_host_allowed && hosts.contains(&host) {
                continue;
            }
            hosts.insert(host);
            targets.push(pool.clone());
        }
        targets
    }
}

#[async_trait]
impl PoolClient for InMemoryPools {
    async fn has_sticky_replica(&self, pool: &str, file_id: &FileId) -> Result<bool> {
        self.check_reachable(pool)?;
        let present = self.namespace.locations(file_id).contains(pool);
        Ok(present && !self.volatile.lock().contains(&(file_id.clone(), pool.to_string())))
    }

    async fn remove_replica(&self, pool: &str, file_id: &FileId, session: SessionTag) -> Result<RemoveOutcome> {
        self.check_reachable(pool)?;
        Self::take_refusal(&self.refused_removals, "remove request")?;
        if !self.namespace.remove_location(file_id, pool) {
            return Ok(RemoveOutcome::NotFound);
        }
        self.removals.lock().push((file_id.clone(), pool.to_string()));
        self.send(
            Envelope::new(ResilienceEvent::LocationCleared {
                file_id: file_id.clone(),
                pool: pool.to_string(),
            })
            .with_session(session),
        );
        Ok(RemoveOutcome::Removed)
    }

    async fn request_copy(&self, request: CopyRequest) -> Result<String> {
        self.check_reachable(&request.source)?;
        Self::take_refusal(&self.refused_copies, "copy request")?;
        let job_id = format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst));
        let status = |pool: Option<String>, outcome| {
            Envelope::new(ResilienceEvent::JobStatus(JobStatus {
                file_id: request.file_id.clone(),
                pool_group: request.target_group.clone(),
                pool,
                job_id: Some(job_id.clone()),
                outcome,
            }))
        };

        let failing = self.failing_copies.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        let targets = if failing { Vec::new() } else { self.choose_targets(&request) };
        self.copies.lock().push(CopyRecord {
            request: request.clone(),
            job_id: job_id.clone(),
            targets: targets.clone(),
        });

        if failing {
            self.send(status(None, JobOutcome::Failed));
        }
        for pool in targets {
            self.namespace.add_location(&request.file_id, &pool);
            self.send(Envelope::new(ResilienceEvent::LocationAdded {
                file_id: request.file_id.clone(),
                pool: pool.clone(),
            }));
            self.send(status(Some(pool), JobOutcome::Succeeded));
        }
        Ok(job_id)
    }
}
