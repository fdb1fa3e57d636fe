//! Units of work and the context they run in.
//!
//! Four task kinds move an operation through its life:
//!
//! ```text
//! event / scan --> start_operation --> verify --+--> replicate --> (job status acks)
//!                                               |
//!                                               +--> reduce ----> (removals applied)
//! ```
//!
//! Every task re-checks that the operation it was handed is still the
//! registered one before doing anything; a replaced or removed operation
//! makes the task a no-op.

pub mod reduce;
pub mod replicate;
pub mod scan;
pub mod verify;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::clients::Alarm;
use crate::clients::AlarmKind;
use crate::clients::AlarmSink;
use crate::clients::NamespaceClient;
use crate::clients::PoolClient;
use crate::config::ResilienceConfig;
use crate::constraints::ConstraintResolver;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::guard::SessionTag;
use crate::operation::FileReplicaOperation;
use crate::operation::operation_key;
use crate::registry::OperationRegistry;
use crate::registry::Registration;
use crate::registry::UpdateOutcome;
use crate::scheduler::TaskCategory;
use crate::scheduler::TaskHandle;
use crate::scheduler::TaskScheduler;
use crate::stats::Counter;
use crate::stats::ResilienceStats;
use crate::topology::TopologyView;
use crate::types::EventKind;
use crate::types::FileId;
use crate::verified::RemovalReason;
use crate::verified::TransitionEvent;
use crate::verified::TransitionPolicy;
pub use scan::ScanPass;
pub use scan::ScanRequest;
pub use scan::ScanSummary;

/// What [`TaskContext::start_operation`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    /// A new operation was registered and a verification submitted.
    Started,
    /// An operation already held the key; it was retriggered.
    Existing,
}

/// Everything a task needs, shared by all tasks of one engine.
pub struct TaskContext {
    pub(crate) config: ResilienceConfig,
    pub(crate) topology: Arc<TopologyView>,
    pub(crate) registry: Arc<OperationRegistry>,
    pub(crate) resolver: ConstraintResolver,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) namespace: Arc<dyn NamespaceClient>,
    pub(crate) pools: Arc<dyn PoolClient>,
    pub(crate) alarms: Arc<dyn AlarmSink>,
    pub(crate) stats: Arc<ResilienceStats>,
    pub(crate) session: SessionTag,
}

impl TaskContext {
    /// Wire a context from its parts.
    pub fn new(
        config: ResilienceConfig,
        topology: Arc<TopologyView>,
        namespace: Arc<dyn NamespaceClient>,
        pools: Arc<dyn PoolClient>,
        alarms: Arc<dyn AlarmSink>,
        stats: Arc<ResilienceStats>,
        session: SessionTag,
    ) -> Self {
        let registry = Arc::new(OperationRegistry::new(TransitionPolicy {
            max_job_retries: config.max_job_retries,
        }));
        let resolver = ConstraintResolver::new(Arc::clone(&topology), Arc::clone(&namespace), config.request_timeout());
        let scheduler = TaskScheduler::new(config.worker_sizes(), Arc::clone(&stats));
        Self {
            config,
            topology,
            registry,
            resolver,
            scheduler,
            namespace,
            pools,
            alarms,
            stats,
            session,
        }
    }

    /// The operation registry.
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// The worker pools.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// The constraint resolver.
    pub fn resolver(&self) -> &ConstraintResolver {
        &self.resolver
    }

    /// The topology view.
    pub fn topology(&self) -> &Arc<TopologyView> {
        &self.topology
    }

    /// Session tag stamped on every outbound request.
    pub fn session(&self) -> SessionTag {
        self.session
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// Enter a file into management (transition 1), or retrigger the
    /// operation already holding its key.
    pub fn start_operation(
        self: &Arc<Self>,
        file_id: FileId,
        group: &str,
        source: Option<String>,
        kind: EventKind,
        excluded: BTreeSet<String>,
    ) -> StartOutcome {
        let key = operation_key(group, &file_id);
        if self.registry.get(&key).is_some() {
            self.apply_event(&key, &TransitionEvent::Retrigger);
            return StartOutcome::Existing;
        }

        let op = FileReplicaOperation::new(file_id, group, source, kind).with_excluded(excluded).shared();
        match self.registry.register_if_absent(op) {
            Registration::Registered(op) => {
                self.stats.incr(Counter::OperationsRegistered);
                debug!(file = %op.file_id(), group, ?kind, "operation registered");
                self.submit_verify(op);
                StartOutcome::Started
            }
            Registration::Existing(_) => {
                self.apply_event(&key, &TransitionEvent::Retrigger);
                StartOutcome::Existing
            }
        }
    }

    /// Apply an event to the operation at `key` and act on the outcome.
    ///
    /// An operation left stalled by an earlier retryable failure is
    /// retriggered by any event that reaches it.
    pub fn apply_event(self: &Arc<Self>, key: &str, event: &TransitionEvent) -> Option<UpdateOutcome> {
        let outcome = self.log_update(key, self.registry.update(key, event))?;
        if let UpdateOutcome::Kept(op) = &outcome {
            if op.is_stalled() && *event != TransitionEvent::Retrigger {
                let retriggered = self.log_update(key, self.registry.update(key, &TransitionEvent::Retrigger))?;
                self.handle_outcome(retriggered.clone());
                return Some(retriggered);
            }
        }
        self.handle_outcome(outcome.clone());
        Some(outcome)
    }

    /// Act on the result of a registry update.
    pub fn handle_outcome(self: &Arc<Self>, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::NotRegistered | UpdateOutcome::Kept(_) => {}
            UpdateOutcome::Resubmit(op) => {
                debug!(file = %op.file_id(), group = op.pool_group(), "operation resubmitted for verification");
                self.submit_verify(op);
            }
            UpdateOutcome::Replaced { old, new } => {
                self.stats.incr(Counter::SourcesReplaced);
                info!(
                    file = %new.file_id(),
                    group = new.pool_group(),
                    old_source = ?old.source(),
                    new_source = ?new.source(),
                    "copy source lost, continuing from another replica"
                );
                self.submit_replicate(new);
            }
            UpdateOutcome::Removed { op, reason } => self.operation_removed(&op, reason),
        }
    }

    /// Unregister `op` if it is still current and account for it.
    pub(crate) fn remove_operation(&self, op: &Arc<FileReplicaOperation>, reason: RemovalReason) -> bool {
        if self.registry.unregister(op) {
            self.operation_removed(op, reason);
            true
        } else {
            false
        }
    }

    pub(crate) fn operation_removed(&self, op: &FileReplicaOperation, reason: RemovalReason) {
        if reason == RemovalReason::Satisfied {
            self.stats.incr(Counter::OperationsSatisfied);
        } else {
            self.stats.incr(Counter::OperationsAborted);
        }
        match reason {
            RemovalReason::Unreachable => self.raise_alarm(
                AlarmKind::InaccessibleFile,
                op,
                None,
                "no readable replica left to copy from, manual recovery required",
            ),
            RemovalReason::Failed => self.raise_alarm(
                AlarmKind::OperationFailed,
                op,
                op.source(),
                "copy jobs kept failing, operation given up",
            ),
            RemovalReason::Cancelled => {
                info!(file = %op.file_id(), group = op.pool_group(), "copy job cancelled, operation removed");
            }
            _ => debug!(file = %op.file_id(), group = op.pool_group(), ?reason, "operation removed"),
        }
    }

    /// Raise an operator alarm about `op`.
    pub(crate) fn raise_alarm(&self, kind: AlarmKind, op: &FileReplicaOperation, pool: Option<&str>, message: &str) {
        self.stats.incr(Counter::AlarmsRaised);
        self.alarms.raise(Alarm {
            kind,
            file_id: Some(op.file_id().clone()),
            pool: pool.map(str::to_string),
            group: Some(op.pool_group().to_string()),
            message: message.to_string(),
        });
    }

    /// Apply the error policy for a failed task step.
    pub(crate) fn handle_task_error(&self, op: &Arc<FileReplicaOperation>, task: &str, error: ResilienceError) {
        match &error {
            ResilienceError::NotFound { .. } => {
                debug!(file = %op.file_id(), group = op.pool_group(), task, error = %error, "nothing to do");
                self.remove_operation(op, RemovalReason::NotFound);
            }
            e if e.is_retryable() => {
                self.stats.incr(Counter::TransientFailures);
                warn!(
                    file = %op.file_id(),
                    group = op.pool_group(),
                    task,
                    error = %error,
                    "task failed, waiting for the next trigger"
                );
                op.mark_stalled();
            }
            ResilienceError::Configuration { message } => {
                self.raise_alarm(AlarmKind::Configuration, op, None, message);
                self.remove_operation(op, RemovalReason::NotRequired);
            }
            ResilienceError::Bug { .. } => {
                self.stats.incr(Counter::Bugs);
                error!(file = %op.file_id(), group = op.pool_group(), task, error = %error, "invariant violated");
            }
            _ => {
                warn!(file = %op.file_id(), group = op.pool_group(), task, error = %error, "task failed");
                op.mark_stalled();
            }
        }
    }

    fn log_update(&self, key: &str, result: Result<UpdateOutcome>) -> Option<UpdateOutcome> {
        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.stats.incr(Counter::Bugs);
                error!(key, error = %e, "registry update failed");
                None
            }
        }
    }

    /// Queue a verification of `op`.
    pub fn submit_verify(self: &Arc<Self>, op: Arc<FileReplicaOperation>) -> TaskHandle {
        let group = op.pool_group().to_string();
        let key = op.key();
        self.submit(&group, TaskCategory::Verify, Some(&key), verify::run(Arc::clone(self), op))
    }

    /// Queue a copy request for `op`.
    pub fn submit_replicate(self: &Arc<Self>, op: Arc<FileReplicaOperation>) -> TaskHandle {
        let group = op.pool_group().to_string();
        let key = op.key();
        self.submit(&group, TaskCategory::Request, Some(&key), replicate::run(Arc::clone(self), op))
    }

    /// Queue replica removals for `op`.
    pub fn submit_reduce(self: &Arc<Self>, op: Arc<FileReplicaOperation>) -> TaskHandle {
        let group = op.pool_group().to_string();
        let key = op.key();
        self.submit(&group, TaskCategory::Request, Some(&key), reduce::run(Arc::clone(self), op))
    }

    /// Queue a pool scan as part of `pass`.
    pub fn submit_scan(self: &Arc<Self>, request: ScanRequest, pass: Arc<ScanPass>) -> TaskHandle {
        let group = request.group.clone();
        let ctx = Arc::clone(self);
        self.submit(&group, TaskCategory::Scan, None, async move {
            scan::run(ctx, request, pass).await;
        })
    }

    /// Queue removal of a corrupt replica.
    ///
    /// With `reverify`, the file is then entered into management without
    /// counting that pool; used when no operation tracked the file.
    pub fn submit_corrupt_cleanup(
        self: &Arc<Self>,
        file_id: FileId,
        group: &str,
        pool: String,
        reverify: bool,
    ) -> TaskHandle {
        let key = operation_key(group, &file_id);
        let ctx = Arc::clone(self);
        let group_name = group.to_string();
        self.submit(group, TaskCategory::Request, Some(&key), async move {
            reduce::remove_corrupt_replica(ctx, file_id, group_name, pool, reverify).await;
        })
    }

    fn submit<F>(&self, group: &str, category: TaskCategory, key: Option<&str>, task: F) -> TaskHandle
    where F: Future<Output = ()> + Send + 'static {
        self.scheduler.submit(group, category, key, task)
    }
}
