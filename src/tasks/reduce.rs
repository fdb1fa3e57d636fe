//! Replica removal for redundant files.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::TaskContext;
use crate::clients::RemoveOutcome;
use crate::clients::with_timeout;
use crate::error::Result;
use crate::operation::FileReplicaOperation;
use crate::stats::Counter;
use crate::types::EventKind;
use crate::types::FileId;
use crate::types::OperationMode;
use crate::verified::request_count;
use crate::verified::select_reduction_targets;

pub(crate) async fn run(ctx: Arc<TaskContext>, op: Arc<FileReplicaOperation>) {
    let removed = reduce(&ctx, &op).await;
    debug!(file = %op.file_id(), group = op.pool_group(), removed, "reduce finished");
    if ctx.registry.is_current(&op) {
        // Some removals failed or were not applied; wait for the next trigger.
        op.mark_stalled();
    }
}

/// Remove `delta` replicas of `op`'s file, returning how many were removed.
///
/// Targets are drawn from the known locations, never the pool that just
/// received the file, preferring pools whose host holds another replica.
/// Per-pool failures are logged and skipped.
pub async fn reduce(ctx: &Arc<TaskContext>, op: &Arc<FileReplicaOperation>) -> usize {
    if !ctx.registry.is_current(op) {
        return 0;
    }
    let state = op.state();
    if state.mode() != OperationMode::Reduce {
        return 0;
    }

    let exclude = match op.kind() {
        EventKind::FileAdded => op.source(),
        _ => None,
    };
    let targets = {
        let topology = ctx.topology.snapshot();
        let mut rng = rand::rng();
        select_reduction_targets(
            &state.known_locations,
            request_count(state.replica_delta),
            exclude,
            |pool| topology.host_of(pool).map(str::to_string),
            &mut rng,
        )
    };
    let requested = u32::try_from(targets.len()).unwrap_or(u32::MAX);
    op.update_state(|s| s.requested = requested);

    let mut removed = 0;
    for pool in targets {
        if !ctx.registry.is_current(op) {
            break;
        }
        match remove_from_pool(ctx, op.file_id(), &pool).await {
            Ok(()) => {
                removed += 1;
                ctx.stats.incr(Counter::ReplicasRemoved);
                info!(file = %op.file_id(), group = op.pool_group(), pool = %pool, "redundant replica removed");
                match ctx.registry.apply_removal(op, &pool) {
                    Ok(outcome) => ctx.handle_outcome(outcome),
                    Err(e) => ctx.handle_task_error(op, "reduce", e),
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    ctx.stats.incr(Counter::TransientFailures);
                }
                warn!(file = %op.file_id(), pool = %pool, error = %e, "failed to remove replica");
            }
        }
    }
    removed
}

/// Remove the replica on `pool`, clearing the namespace entry if the pool
/// no longer has it.
async fn remove_from_pool(ctx: &TaskContext, file_id: &FileId, pool: &str) -> Result<()> {
    let outcome =
        with_timeout("remove_replica", ctx.request_timeout(), ctx.pools.remove_replica(pool, file_id, ctx.session))
            .await?;
    if outcome == RemoveOutcome::NotFound {
        debug!(file = %file_id, pool, "replica already gone, clearing stale location");
        with_timeout(
            "clear_cache_location",
            ctx.request_timeout(),
            ctx.namespace.clear_cache_location(file_id, pool, ctx.session),
        )
        .await?;
    }
    Ok(())
}

/// Drop a corrupt replica, then optionally re-verify the file without
/// counting that pool.
pub(crate) async fn remove_corrupt_replica(
    ctx: Arc<TaskContext>,
    file_id: FileId,
    group: String,
    pool: String,
    reverify: bool,
) {
    match remove_from_pool(&ctx, &file_id, &pool).await {
        Ok(()) => {
            ctx.stats.incr(Counter::ReplicasRemoved);
            info!(file = %file_id, group = %group, pool = %pool, "corrupt replica removed");
        }
        Err(e) => warn!(file = %file_id, pool = %pool, error = %e, "failed to remove corrupt replica"),
    }
    if reverify {
        let excluded = BTreeSet::from([pool.clone()]);
        ctx.start_operation(file_id, &group, Some(pool), EventKind::FileCleared, excluded);
    }
}
