//! Inbound event routing.
//!
//! All inbound traffic is one closed [`ResilienceEvent`] enum, wrapped in an
//! [`Envelope`] carrying the sender's session tag. [`EventRouter::dispatch`]
//! runs the guard, then routes each variant to the registry, the topology
//! view or the scheduler. Dispatch never blocks on a collaborator: anything
//! that needs a round-trip is queued as a task.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::clients::ScanKind;
use crate::error::Result;
use crate::guard::MessageGuard;
use crate::guard::SessionTag;
use crate::operation::operation_key;
use crate::scheduler::TaskHandle;
use crate::tasks::ScanPass;
use crate::tasks::ScanRequest;
use crate::tasks::TaskContext;
use crate::types::EventKind;
use crate::types::FileId;
use crate::types::JobOutcome;
use crate::types::JobStatus;
use crate::types::PoolStatus;
use crate::verified::TransitionEvent;

/// Change of pool group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    /// The pool joined the group.
    Added,
    /// The pool left the group.
    Removed,
}

/// Every event the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    /// A replica appeared on a pool.
    LocationAdded {
        /// File.
        file_id: FileId,
        /// Pool now holding a replica.
        pool: String,
    },
    /// A replica disappeared from a pool.
    LocationCleared {
        /// File.
        file_id: FileId,
        /// Pool that lost its replica.
        pool: String,
    },
    /// A pool changed status.
    PoolStatusChanged {
        /// Pool.
        pool: String,
        /// New status.
        status: PoolStatus,
    },
    /// A pool joined or left a group.
    PoolGroupMembership {
        /// Pool.
        pool: String,
        /// Group.
        group: String,
        /// Direction.
        change: MembershipChange,
    },
    /// A copy job reported progress.
    JobStatus(JobStatus),
    /// A replica was found corrupt.
    CorruptFileDetected {
        /// File.
        file_id: FileId,
        /// Pool holding the corrupt replica.
        pool: String,
    },
}

impl ResilienceEvent {
    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::LocationAdded { .. } => "location_added",
            ResilienceEvent::LocationCleared { .. } => "location_cleared",
            ResilienceEvent::PoolStatusChanged { .. } => "pool_status_changed",
            ResilienceEvent::PoolGroupMembership { .. } => "pool_group_membership",
            ResilienceEvent::JobStatus(_) => "job_status",
            ResilienceEvent::CorruptFileDetected { .. } => "corrupt_file_detected",
        }
    }
}

/// An event plus the session tag of whoever caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session of the engine whose request caused the event, if any.
    pub session: Option<SessionTag>,
    /// The event.
    pub event: ResilienceEvent,
}

impl Envelope {
    /// Wrap an untagged event.
    pub fn new(event: ResilienceEvent) -> Self {
        Self { session: None, event }
    }

    /// Set the session tag.
    pub fn with_session(mut self, session: SessionTag) -> Self {
        self.session = Some(session);
        self
    }
}

/// Single dispatch point for inbound events.
pub struct EventRouter {
    ctx: Arc<TaskContext>,
    guard: Arc<MessageGuard>,
    pool_down_grace: Duration,
    pending_down_scans: Arc<Mutex<HashMap<String, PendingScan>>>,
    next_down_scan: AtomicU64,
}

/// Down scan waiting out the grace period of one pool.
struct PendingScan {
    id: u64,
    handle: TaskHandle,
}

impl EventRouter {
    /// Create a router.
    pub fn new(ctx: Arc<TaskContext>, guard: Arc<MessageGuard>, pool_down_grace: Duration) -> Self {
        Self {
            ctx,
            guard,
            pool_down_grace,
            pending_down_scans: Arc::new(Mutex::new(HashMap::new())),
            next_down_scan: AtomicU64::new(0),
        }
    }

    /// Handle one event. Returns false if the guard dropped it.
    pub fn dispatch(&self, mut envelope: Envelope) -> Result<bool> {
        if !self.guard.accept(&mut envelope) {
            return Ok(false);
        }
        debug!(event = envelope.event.name(), "dispatching event");

        match envelope.event {
            ResilienceEvent::LocationAdded { file_id, pool } => {
                self.location_changed(file_id, &pool, TransitionEvent::LocationAdded { pool: pool.clone() })
            }
            ResilienceEvent::LocationCleared { file_id, pool } => {
                self.location_changed(file_id, &pool, TransitionEvent::LocationCleared { pool: pool.clone() })
            }
            ResilienceEvent::JobStatus(status) => self.job_status(status),
            ResilienceEvent::CorruptFileDetected { file_id, pool } => self.corrupt_file(file_id, pool),
            ResilienceEvent::PoolStatusChanged { pool, status } => self.pool_status_changed(&pool, status)?,
            ResilienceEvent::PoolGroupMembership { pool, group, change } => {
                self.membership_changed(&pool, &group, change)?
            }
        }
        Ok(true)
    }

    /// Number of pools waiting out their down grace period.
    pub fn pending_down_scans(&self) -> usize {
        self.pending_down_scans.lock().len()
    }

    fn location_changed(&self, file_id: FileId, pool: &str, event: TransitionEvent) {
        let Some(group) = self.resilient_group_of(pool) else {
            debug!(file = %file_id, pool, "pool is not in a resilient group, ignoring");
            return;
        };
        let key = operation_key(&group, &file_id);
        if self.ctx.registry.get(&key).is_some() {
            self.ctx.apply_event(&key, &event);
            return;
        }
        let kind = match event {
            TransitionEvent::LocationCleared { .. } => EventKind::FileCleared,
            _ => EventKind::FileAdded,
        };
        self.ctx.start_operation(file_id, &group, Some(pool.to_string()), kind, BTreeSet::new());
    }

    fn job_status(&self, status: JobStatus) {
        let key = operation_key(&status.pool_group, &status.file_id);
        let tracked = self.ctx.registry.get(&key).is_some();
        if tracked {
            let event = TransitionEvent::Acknowledged {
                outcome: status.outcome,
                pool: status.pool.clone(),
            };
            self.ctx.apply_event(&key, &event);
        } else {
            debug!(file = %status.file_id, group = %status.pool_group, "job status for untracked file");
        }
        if let (JobOutcome::Corrupt, Some(pool)) = (status.outcome, status.pool) {
            info!(file = %status.file_id, pool = %pool, "copy job found a corrupt replica, removing it");
            self.ctx.submit_corrupt_cleanup(status.file_id, &status.pool_group, pool, !tracked);
        }
    }

    fn corrupt_file(&self, file_id: FileId, pool: String) {
        let Some(group) = self.resilient_group_of(&pool) else {
            debug!(file = %file_id, pool = %pool, "corrupt replica outside resilient groups, ignoring");
            return;
        };
        let key = operation_key(&group, &file_id);
        // The operation stops counting the pool; the replica itself goes either way.
        let tracked = self.ctx.registry.get(&key).is_some();
        if tracked {
            self.ctx.apply_event(&key, &TransitionEvent::Corrupt { pool: pool.clone() });
        }
        info!(file = %file_id, pool = %pool, "removing corrupt replica");
        self.ctx.submit_corrupt_cleanup(file_id, &group, pool, !tracked);
    }

    fn pool_status_changed(&self, pool: &str, status: PoolStatus) -> Result<()> {
        match status {
            PoolStatus::Down => {
                if self.ctx.topology.set_pool_active(pool, false)? {
                    info!(pool, grace = ?self.pool_down_grace, "pool down");
                    self.schedule_down_scan(pool);
                }
            }
            PoolStatus::Restart => {
                self.cancel_down_scan(pool);
                self.ctx.topology.set_pool_active(pool, true)?;
                info!(pool, "pool restarted, scanning");
                if let Some(group) = self.resilient_group_of(pool) {
                    self.ctx.submit_scan(ScanRequest::new(pool, group, ScanKind::Full), ScanPass::new());
                }
            }
            PoolStatus::Up => {
                self.cancel_down_scan(pool);
                if self.ctx.topology.set_pool_active(pool, true)? {
                    info!(pool, "pool up");
                }
            }
        }
        Ok(())
    }

    fn membership_changed(&self, pool: &str, group: &str, change: MembershipChange) -> Result<()> {
        let resilient = self.ctx.topology.snapshot().group(group).is_some_and(|g| g.is_resilient());
        match change {
            MembershipChange::Added => {
                self.ctx.topology.add_pool_to_group(pool, group)?;
                info!(pool, group, "pool added to group");
                if resilient {
                    self.ctx.submit_scan(ScanRequest::new(pool, group, ScanKind::Full), ScanPass::new());
                }
            }
            MembershipChange::Removed => {
                self.ctx.topology.remove_pool_from_group(pool, group)?;
                info!(pool, group, "pool removed from group");
                if resilient {
                    let request = ScanRequest::new(pool, group, ScanKind::Deficient).excluding(pool);
                    self.ctx.submit_scan(request, ScanPass::new());
                }
            }
        }
        Ok(())
    }

    fn schedule_down_scan(&self, pool: &str) {
        let Some(group) = self.resilient_group_of(pool) else {
            return;
        };
        let ctx = Arc::clone(&self.ctx);
        let pending = Arc::clone(&self.pending_down_scans);
        let id = self.next_down_scan.fetch_add(1, Ordering::Relaxed);
        let grace = self.pool_down_grace;
        let request = ScanRequest::new(pool, group, ScanKind::Deficient).excluding(pool);

        // Hold the map lock across the spawn so the timer cannot fire and
        // look for its entry before it is inserted.
        let mut scans = self.pending_down_scans.lock();
        let handle = self.ctx.scheduler.spawn(async move {
            tokio::time::sleep(grace).await;
            {
                let mut scans = pending.lock();
                if scans.get(&request.pool).is_some_and(|p| p.id == id) {
                    scans.remove(&request.pool);
                }
            }
            info!(pool = %request.pool, "pool still down after grace period, scanning");
            ctx.submit_scan(request, ScanPass::new());
        });
        if let Some(previous) = scans.insert(pool.to_string(), PendingScan { id, handle }) {
            previous.handle.cancel();
        }
    }

    fn cancel_down_scan(&self, pool: &str) {
        if let Some(pending) = self.pending_down_scans.lock().remove(pool) {
            debug!(pool, "pool back before grace period, down scan cancelled");
            pending.handle.cancel();
        }
    }

    fn resilient_group_of(&self, pool: &str) -> Option<String> {
        self.ctx.topology.snapshot().resilient_group_of(pool).map(|g| g.name.clone())
    }
}
