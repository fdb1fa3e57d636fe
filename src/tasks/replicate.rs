//! Copy requests for deficient files.

use std::sync::Arc;

use tracing::debug;
use tracing::info;

use super::TaskContext;
use crate::clients::CopyRequest;
use crate::clients::with_timeout;
use crate::error::Result;
use crate::operation::FileReplicaOperation;
use crate::stats::Counter;
use crate::types::EventKind;
use crate::types::OperationMode;
use crate::verified::RemovalReason;
use crate::verified::choose_source;
use crate::verified::request_count;

pub(crate) async fn run(ctx: Arc<TaskContext>, op: Arc<FileReplicaOperation>) {
    if let Err(e) = replicate(&ctx, &op).await {
        ctx.handle_task_error(&op, "replicate", e);
    }
}

/// Ask the migration engine for `|delta|` new replicas of `op`'s file.
///
/// The request is fire-and-forget: completion arrives later as job status
/// events. Returns the job id, or `None` when nothing was requested.
pub async fn replicate(ctx: &TaskContext, op: &Arc<FileReplicaOperation>) -> Result<Option<String>> {
    if !ctx.registry.is_current(op) {
        return Ok(None);
    }
    let state = op.state();
    if state.mode() != OperationMode::Replicate {
        debug!(file = %op.file_id(), mode = %state.mode(), "operation no longer replicating");
        return Ok(None);
    }

    // A source substituted after the previous one was lost is kept as is.
    let preferred = match state.copy_source.as_deref() {
        Some(source) => Some(source),
        None => op.source().filter(|_| op.kind() != EventKind::FileCleared),
    };
    let source = match preferred {
        Some(source) if state.known_locations.contains(source) => Some(source.to_string()),
        _ => {
            let mut rng = rand::rng();
            choose_source(&state.known_locations, &mut rng)
        }
    };
    let Some(source) = source else {
        ctx.remove_operation(op, RemovalReason::Unreachable);
        return Ok(None);
    };

    let constraints = ctx.resolver.for_file(op.file_id(), op.pool_group()).await?;
    let count = request_count(state.replica_delta);
    let mut exclude_pools = state.known_locations.clone();
    exclude_pools.extend(op.excluded_pools().iter().cloned());
    exclude_pools.extend(state.corrupt_pools.iter().cloned());

    let request = CopyRequest {
        file_id: op.file_id().clone(),
        source: source.clone(),
        target_group: op.pool_group().to_string(),
        count,
        same_host_allowed: constraints.same_host_allowed,
        exclude_pools,
        sticky: true,
        session: ctx.session,
    };
    let job_id = with_timeout("request_copy", ctx.request_timeout(), ctx.pools.request_copy(request)).await?;

    op.update_state(|s| {
        s.requested = count;
        s.copy_source = Some(source.clone());
        s.job_id = Some(job_id.clone());
    });
    ctx.stats.add(Counter::CopiesRequested, u64::from(count));
    info!(file = %op.file_id(), group = op.pool_group(), source = %source, count, job = %job_id, "copies requested");
    Ok(Some(job_id))
}
