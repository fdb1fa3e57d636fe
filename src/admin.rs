//! Operator commands.
//!
//! Every command returns a serializable value; rendering is left to the
//! caller.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::clients::ScanKind;
use crate::clients::with_timeout;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::guard::MessageGuard;
use crate::operation::OperationInfo;
use crate::registry::OperationFilter;
use crate::scheduler::TaskHandle;
use crate::stats::StatsSnapshot;
use crate::tasks::ScanPass;
use crate::tasks::ScanRequest;
use crate::tasks::StartOutcome;
use crate::tasks::TaskContext;
use crate::types::EventKind;
use crate::types::FileId;
use crate::verified::RemovalReason;
use crate::watchdog::Watchdog;
use crate::watchdog::WatchdogCommand;
use crate::watchdog::WatchdogInfo;

/// Result of a constraint check of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintCheck {
    /// Group checked.
    pub group: String,
    /// Problem found, if any.
    pub problem: Option<String>,
}

impl ConstraintCheck {
    /// Whether the group can meet its constraints.
    pub fn is_ok(&self) -> bool {
        self.problem.is_none()
    }
}

/// Result of a cancel command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSummary {
    /// Keys of the removed operations.
    pub cancelled: Vec<String>,
    /// How many of them still had tasks running.
    pub interrupted: usize,
}

/// Operator surface of one engine.
#[derive(Clone)]
pub struct ResilienceAdmin {
    ctx: Arc<TaskContext>,
    guard: Arc<MessageGuard>,
    watchdog: Arc<Watchdog>,
}

impl ResilienceAdmin {
    /// Create the admin surface.
    pub fn new(ctx: Arc<TaskContext>, guard: Arc<MessageGuard>, watchdog: Arc<Watchdog>) -> Self {
        Self { ctx, guard, watchdog }
    }

    /// Put one file under management.
    ///
    /// Without `group`, the group is the resilient group of the first pool
    /// the namespace lists for the file.
    pub async fn adjust_file(&self, file_id: FileId, group: Option<String>) -> Result<StartOutcome> {
        let group = match group {
            Some(group) => group,
            None => {
                let locations = with_timeout(
                    "file_locations",
                    self.ctx.request_timeout(),
                    self.ctx.namespace.file_locations(&file_id),
                )
                .await?;
                let topology = self.ctx.topology.snapshot();
                locations
                    .iter()
                    .find_map(|pool| topology.resilient_group_of(pool).map(|g| g.name.clone()))
                    .ok_or_else(|| ResilienceError::not_found("resilient group of file", file_id.as_str()))?
            }
        };
        self.ensure_resilient(&group)?;
        info!(file = %file_id, group = %group, "operator adjust of file");
        Ok(self.ctx.start_operation(file_id, &group, None, EventKind::Indeterminate, Default::default()))
    }

    /// Run a full scan of one pool.
    pub fn adjust_pool(&self, pool: &str) -> Result<TaskHandle> {
        let group = self
            .ctx
            .topology
            .snapshot()
            .resilient_group_of(pool)
            .map(|g| g.name.clone())
            .ok_or_else(|| ResilienceError::not_found("resilient pool", pool))?;
        info!(pool, group = %group, "operator scan of pool");
        Ok(self.ctx.submit_scan(ScanRequest::new(pool, group, ScanKind::Full), ScanPass::new()))
    }

    /// Run a full scan of every active pool of a group, sharing one pass.
    pub fn adjust_group(&self, group: &str) -> Result<Vec<TaskHandle>> {
        self.ensure_resilient(group)?;
        let view = self
            .ctx
            .topology
            .snapshot()
            .group_view(group)
            .ok_or_else(|| ResilienceError::not_found("pool group", group))?;
        info!(group, pools = view.active_pools.len(), "operator scan of group");
        let pass = ScanPass::new();
        Ok(view
            .active_pools
            .iter()
            .map(|pool| self.ctx.submit_scan(ScanRequest::new(pool.as_str(), group, ScanKind::Full), Arc::clone(&pass)))
            .collect())
    }

    /// Operations matching `filter`, oldest first.
    pub fn list_operations(&self, filter: &OperationFilter) -> Vec<OperationInfo> {
        self.ctx.registry.list(filter)
    }

    /// Remove every operation matching `filter` and cancel its tasks.
    pub fn cancel_operations(&self, filter: &OperationFilter) -> CancelSummary {
        let removed = self.ctx.registry.remove_matching(|op| filter.matches(op));
        let mut summary = CancelSummary::default();
        for op in removed {
            let key = op.key();
            if self.ctx.scheduler.cancel_operation(&key) {
                summary.interrupted += 1;
            }
            self.ctx.operation_removed(&op, RemovalReason::Operator);
            summary.cancelled.push(key);
        }
        info!(cancelled = summary.cancelled.len(), interrupted = summary.interrupted, "operations cancelled");
        summary
    }

    /// Control the watchdog.
    pub fn watchdog(&self, command: WatchdogCommand) -> WatchdogInfo {
        self.watchdog.command(command)
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot(self.ctx.registry.len())
    }

    /// Check one group, or every resilient group when `group` is `None`.
    pub fn verify_constraints(&self, group: Option<&str>) -> Result<Vec<ConstraintCheck>> {
        let groups = match group {
            Some(group) => vec![group.to_string()],
            None => self.ctx.topology.snapshot().resilient_groups(),
        };
        groups
            .into_iter()
            .map(|group| match self.ctx.resolver.verify_group(&group) {
                Ok(()) => Ok(ConstraintCheck { group, problem: None }),
                Err(ResilienceError::Configuration { message }) => Ok(ConstraintCheck {
                    group,
                    problem: Some(message),
                }),
                Err(e) => Err(e),
            })
            .collect()
    }

    /// Let inbound events through.
    pub fn enable(&self) {
        self.guard.enable();
    }

    /// Drop inbound events until re-enabled.
    pub fn disable(&self) {
        self.guard.disable();
    }

    /// Whether inbound events are let through.
    pub fn is_enabled(&self) -> bool {
        self.guard.is_open()
    }

    fn ensure_resilient(&self, group: &str) -> Result<()> {
        match self.ctx.topology.snapshot().group(group) {
            Some(config) if config.is_resilient() => Ok(()),
            Some(_) => Err(ResilienceError::Configuration {
                message: format!("pool group {group} is not resilient"),
            }),
            None => Err(ResilienceError::not_found("pool group", group)),
        }
    }
}
