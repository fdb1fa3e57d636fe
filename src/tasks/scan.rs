//! Pool scans: find files of one pool whose replica count is off.
//!
//! A scan asks the namespace for every file on a pool whose count, over the
//! active pools of the group minus the excluded ones, is deficient,
//! excessive or either, using the group's folded bounds. Each file found
//! enters management as if an event had arrived for it. A [`ScanPass`] is
//! shared by all scans of one sweep so a file reachable from several pools
//! of the group is handled once.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::StartOutcome;
use super::TaskContext;
use crate::clients::ScanKind;
use crate::clients::ScanQuery;
use crate::clients::with_timeout;
use crate::constants::MAX_SCAN_RESULTS;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::operation::operation_key;
use crate::stats::Counter;
use crate::types::EventKind;

/// One pool scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Pool whose files are enumerated.
    pub pool: String,
    /// Group the counts are taken against.
    pub group: String,
    /// Selection.
    pub kind: ScanKind,
    /// Pools whose replicas are not counted.
    pub exclude: BTreeSet<String>,
}

impl ScanRequest {
    /// Scan `pool` against `group` with no exclusions.
    pub fn new(pool: impl Into<String>, group: impl Into<String>, kind: ScanKind) -> Self {
        Self {
            pool: pool.into(),
            group: group.into(),
            kind,
            exclude: BTreeSet::new(),
        }
    }

    /// Do not count replicas on `pool`.
    pub fn excluding(mut self, pool: impl Into<String>) -> Self {
        self.exclude.insert(pool.into());
        self
    }
}

/// Files already handled during one sweep.
#[derive(Debug, Default)]
pub struct ScanPass {
    visited: Mutex<HashSet<String>>,
}

impl ScanPass {
    /// A fresh pass.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a visit; false if the key was already visited in this pass.
    pub fn first_visit(&self, key: &str) -> bool {
        self.visited.lock().insert(key.to_string())
    }

    /// Number of distinct files visited.
    pub fn visited(&self) -> usize {
        self.visited.lock().len()
    }
}

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Files returned by the namespace.
    pub found: usize,
    /// Files skipped because the pass had already seen them.
    pub duplicates: usize,
    /// New operations started.
    pub started: usize,
    /// Existing operations retriggered.
    pub retriggered: usize,
}

pub(crate) async fn run(ctx: Arc<TaskContext>, request: ScanRequest, pass: Arc<ScanPass>) {
    match scan(&ctx, &request, &pass).await {
        Ok(summary) => {
            ctx.stats.incr(Counter::ScansCompleted);
            info!(
                pool = %request.pool,
                group = %request.group,
                kind = ?request.kind,
                found = summary.found,
                started = summary.started,
                "pool scan finished"
            );
        }
        Err(e) => {
            if e.is_retryable() {
                ctx.stats.incr(Counter::TransientFailures);
            }
            warn!(pool = %request.pool, group = %request.group, error = %e, "pool scan failed");
        }
    }
}

/// Run one scan and feed every selected file into transition 1.
pub async fn scan(ctx: &Arc<TaskContext>, request: &ScanRequest, pass: &ScanPass) -> Result<ScanSummary> {
    let constraints = ctx.resolver.for_group(&request.group)?;
    let view = ctx
        .topology
        .snapshot()
        .group_view(&request.group)
        .ok_or_else(|| ResilienceError::not_found("pool group", &request.group))?;
    let counted_pools: BTreeSet<String> = view.active_pools.difference(&request.exclude).cloned().collect();

    let query = ScanQuery {
        pool: request.pool.clone(),
        group: request.group.clone(),
        counted_pools,
        exclude: request.exclude.clone(),
        kind: request.kind,
        minimum: constraints.minimum,
        maximum: constraints.maximum,
    };
    debug!(pool = %query.pool, group = %query.group, kind = ?query.kind, "scanning pool");
    let entries = with_timeout("scan_pool", ctx.request_timeout(), ctx.namespace.scan_pool(&query)).await?;

    let mut summary = ScanSummary::default();
    for entry in entries.into_iter().take(MAX_SCAN_RESULTS as usize) {
        summary.found += 1;
        ctx.stats.incr(Counter::FilesScanned);

        let key = operation_key(&request.group, &entry.file_id);
        if !pass.first_visit(&key) {
            summary.duplicates += 1;
            continue;
        }
        let source = (entry.locations.contains(&request.pool) && !request.exclude.contains(&request.pool))
            .then(|| request.pool.clone());
        match ctx.start_operation(entry.file_id, &request.group, source, EventKind::Scan, request.exclude.clone()) {
            StartOutcome::Started => summary.started += 1,
            StartOutcome::Existing => summary.retriggered += 1,
        }
    }
    Ok(summary)
}
