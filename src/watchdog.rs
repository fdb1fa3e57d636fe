//! Periodic scanner.
//!
//! Once per interval the watchdog walks every active pool of every
//! resilient group and runs a full scan of it, one pool at a time, waiting
//! for each scan to finish before starting the next. Pools that are the
//! source of an in-flight operation are skipped for that pass; a stalled
//! operation does not make its pool busy, so the pass retriggers it.
//!
//! # Tiger Style
//!
//! - Single background task per engine
//! - At most one scan of a pass in flight at any time
//! - Explicit cancellation of the current pass and of the loop

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::clients::ScanKind;
use crate::scheduler::TaskHandle;
use crate::tasks::ScanPass;
use crate::tasks::ScanRequest;
use crate::tasks::TaskContext;

/// Operator control of the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogCommand {
    /// Resume periodic passes.
    Enable,
    /// Stop periodic passes and cancel the current one.
    Disable,
    /// Start a pass now.
    RunNow,
    /// Cancel the current pass only.
    CancelCurrent,
    /// Report status.
    Info,
}

/// Watchdog status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogInfo {
    /// Whether periodic passes run.
    pub enabled: bool,
    /// Whether a pass is in progress.
    pub running: bool,
    /// Pool being scanned by the current pass.
    pub current_pool: Option<String>,
    /// Period between passes, in seconds.
    pub interval_secs: u64,
    /// When the next pass is due.
    pub next_run: Option<DateTime<Utc>>,
    /// When the last pass started.
    pub last_start: Option<DateTime<Utc>>,
    /// When the last pass ended.
    pub last_end: Option<DateTime<Utc>>,
    /// Passes run to completion.
    pub passes_completed: u64,
    /// Passes cut short by cancellation.
    pub passes_cancelled: u64,
}

/// Result of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Pools scanned, in order.
    pub scanned: Vec<String>,
    /// Pools skipped because they had in-flight operations.
    pub skipped: Vec<String>,
    /// Whether the pass was cancelled.
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct WatchdogState {
    running: bool,
    current_pool: Option<String>,
    next_run: Option<DateTime<Utc>>,
    last_start: Option<DateTime<Utc>>,
    last_end: Option<DateTime<Utc>>,
    passes_completed: u64,
    passes_cancelled: u64,
}

/// Periodic sequential scanner of resilient pools.
pub struct Watchdog {
    ctx: Arc<TaskContext>,
    interval: Duration,
    initial_delay: Duration,
    enabled: AtomicBool,
    run_now: Notify,
    current_pass: Mutex<CancellationToken>,
    state: Mutex<WatchdogState>,
}

impl Watchdog {
    /// Create a watchdog. Nothing runs until [`spawn`](Self::spawn).
    pub fn new(ctx: Arc<TaskContext>, interval: Duration, initial_delay: Duration, enabled: bool) -> Self {
        Self {
            ctx,
            interval,
            initial_delay,
            enabled: AtomicBool::new(enabled),
            run_now: Notify::new(),
            current_pass: Mutex::new(CancellationToken::new()),
            state: Mutex::new(WatchdogState::default()),
        }
    }

    /// Start the background loop on the scheduler; stopped by its shutdown.
    pub fn spawn(self: &Arc<Self>) -> TaskHandle {
        let watchdog = Arc::clone(self);
        self.ctx.scheduler.spawn(async move { watchdog.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!(interval = ?self.interval, initial_delay = ?self.initial_delay, "watchdog started");
        let mut delay = self.initial_delay;
        loop {
            self.state.lock().next_run = Some(Utc::now() + to_chrono(delay));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.run_now.notified() => debug!("watchdog pass requested"),
            }
            if self.enabled.load(Ordering::Acquire) {
                self.run_pass().await;
            }
            delay = self.interval;
        }
    }

    /// Execute one command.
    pub fn command(&self, command: WatchdogCommand) -> WatchdogInfo {
        match command {
            WatchdogCommand::Enable => {
                self.enabled.store(true, Ordering::Release);
                info!("watchdog enabled");
            }
            WatchdogCommand::Disable => {
                self.enabled.store(false, Ordering::Release);
                self.cancel_current();
                info!("watchdog disabled");
            }
            WatchdogCommand::RunNow => self.run_now.notify_one(),
            WatchdogCommand::CancelCurrent => self.cancel_current(),
            WatchdogCommand::Info => {}
        }
        self.info()
    }

    /// Cancel the pass in progress, if any.
    pub fn cancel_current(&self) {
        self.current_pass.lock().cancel();
    }

    /// Current status.
    pub fn info(&self) -> WatchdogInfo {
        let state = self.state.lock();
        WatchdogInfo {
            enabled: self.enabled.load(Ordering::Acquire),
            running: state.running,
            current_pool: state.current_pool.clone(),
            interval_secs: self.interval.as_secs(),
            next_run: state.next_run,
            last_start: state.last_start,
            last_end: state.last_end,
            passes_completed: state.passes_completed,
            passes_cancelled: state.passes_cancelled,
        }
    }

    /// Scan every active resilient pool once, sequentially.
    pub async fn run_pass(&self) -> PassSummary {
        let token = CancellationToken::new();
        *self.current_pass.lock() = token.clone();
        {
            let mut state = self.state.lock();
            state.running = true;
            state.last_start = Some(Utc::now());
        }

        let pools = self.ctx.topology.snapshot().active_resilient_pools();
        let busy = self.ctx.registry.busy_source_pools();
        let pass = ScanPass::new();
        let mut summary = PassSummary::default();
        info!(pools = pools.len(), busy = busy.len(), "watchdog pass started");

        for (pool, group) in pools {
            if token.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if busy.contains(&pool) {
                debug!(pool = %pool, "pool has in-flight operations, skipping");
                summary.skipped.push(pool);
                continue;
            }
            self.state.lock().current_pool = Some(pool.clone());

            let handle = self.ctx.submit_scan(ScanRequest::new(pool.clone(), group, ScanKind::Full), Arc::clone(&pass));
            let scan_cancel = handle.cancellation_token();
            tokio::select! {
                _ = token.cancelled() => {
                    scan_cancel.cancel();
                    summary.cancelled = true;
                }
                _ = handle.join() => summary.scanned.push(pool),
            }
            if summary.cancelled {
                break;
            }
        }

        let mut state = self.state.lock();
        state.running = false;
        state.current_pool = None;
        state.last_end = Some(Utc::now());
        if summary.cancelled {
            state.passes_cancelled += 1;
            info!(scanned = summary.scanned.len(), "watchdog pass cancelled");
        } else {
            state.passes_completed += 1;
            info!(scanned = summary.scanned.len(), skipped = summary.skipped.len(), "watchdog pass finished");
        }
        summary
    }

}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}
