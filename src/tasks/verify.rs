//! File verification: count durable replicas and decide what to do.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use super::TaskContext;
use crate::clients::AlarmKind;
use crate::clients::with_timeout;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::operation::FileReplicaOperation;
use crate::registry::VerificationOutcome;
use crate::stats::Counter;
use crate::verified::RemovalReason;
use crate::verified::compute_replica_delta;

/// Result of one verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The operation was replaced or removed while the task waited.
    Superseded,
    /// The file needs no management (not online, or minimum of one).
    NotRequired,
    /// No counted replica exists.
    NoReplica,
    /// Replica count is within bounds.
    Satisfied,
    /// Copies were queued.
    Replicate,
    /// Removals were queued.
    Reduce,
}

pub(crate) async fn run(ctx: Arc<TaskContext>, op: Arc<FileReplicaOperation>) {
    match verify(&ctx, &op).await {
        Ok(Verification::Replicate) => {
            ctx.submit_replicate(op);
        }
        Ok(Verification::Reduce) => {
            ctx.submit_reduce(op);
        }
        Ok(outcome) => debug!(file = %op.file_id(), group = op.pool_group(), ?outcome, "verification finished"),
        Err(e) => ctx.handle_task_error(&op, "verify", e),
    }
}

/// Count the durable, accessible replicas of `op`'s file and record the delta.
///
/// A location counts when its pool is an active member of the group, is not
/// excluded by the operation or known to hold a corrupt copy, and actually
/// holds a sticky replica. Pools
/// whose sticky check fails are skipped for this round.
pub async fn verify(ctx: &TaskContext, op: &Arc<FileReplicaOperation>) -> Result<Verification> {
    if !ctx.registry.is_current(op) {
        return Ok(Verification::Superseded);
    }

    let file_id = op.file_id();
    let group = op.pool_group();
    let constraints = ctx.resolver.for_file(file_id, group).await?;
    if !constraints.requires_replication {
        ctx.remove_operation(op, RemovalReason::NotRequired);
        return Ok(Verification::NotRequired);
    }

    let view = ctx
        .topology
        .snapshot()
        .group_view(group)
        .ok_or_else(|| ResilienceError::not_found("pool group", group))?;

    let locations = with_timeout("file_locations", ctx.request_timeout(), ctx.namespace.file_locations(file_id)).await?;
    let corrupt = op.state().corrupt_pools;
    let candidates: Vec<&String> = locations
        .iter()
        .filter(|pool| view.active_pools.contains(*pool))
        .filter(|pool| !op.excluded_pools().contains(*pool) && !corrupt.contains(*pool))
        .collect();

    let mut known = BTreeSet::new();
    for pool in candidates {
        let sticky =
            with_timeout("has_sticky_replica", ctx.request_timeout(), ctx.pools.has_sticky_replica(pool, file_id)).await;
        match sticky {
            Ok(true) => {
                known.insert(pool.clone());
            }
            Ok(false) => debug!(file = %file_id, pool = %pool, "replica is not sticky, not counted"),
            Err(e) => warn!(file = %file_id, pool = %pool, error = %e, "sticky check failed, replica not counted"),
        }
    }

    if known.is_empty() {
        if ctx.remove_operation(op, RemovalReason::Lost) {
            let (kind, message) = if locations.is_empty() {
                (AlarmKind::LostFile, "file has no replica on any pool")
            } else {
                (AlarmKind::InaccessibleFile, "file has no accessible durable replica in its group")
            };
            ctx.raise_alarm(kind, op, None, message);
        }
        return Ok(Verification::NoReplica);
    }

    let count = u32::try_from(known.len()).unwrap_or(u32::MAX);
    let delta = compute_replica_delta(count, constraints.minimum, constraints.maximum, ctx.config.is_greedy(group));
    debug!(file = %file_id, group, count, delta, "replicas verified");

    Ok(match ctx.registry.record_verification(op, known, delta) {
        VerificationOutcome::Superseded => Verification::Superseded,
        VerificationOutcome::Satisfied => {
            ctx.stats.incr(Counter::OperationsSatisfied);
            Verification::Satisfied
        }
        VerificationOutcome::Replicate => Verification::Replicate,
        VerificationOutcome::Reduce => Verification::Reduce,
    })
}
