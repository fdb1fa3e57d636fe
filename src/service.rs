//! Engine wiring and lifecycle.
//!
//! [`ResilienceService`] owns one guard, one task context, one router and
//! one watchdog. Events enter through [`ResilienceService::dispatch`] or an
//! event channel drained by [`ResilienceService::run_events`]; operators act
//! through [`ResilienceService::admin`].
//!
//! # Tiger Style
//!
//! - Every background task runs on the scheduler and stops on shutdown
//! - Checkpoints are written atomically and capped in size

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::admin::ResilienceAdmin;
use crate::checkpoint::read_checkpoint;
use crate::checkpoint::write_checkpoint;
use crate::clients::AlarmSink;
use crate::clients::NamespaceClient;
use crate::clients::PoolClient;
use crate::config::ResilienceConfig;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::guard::MessageGuard;
use crate::guard::SessionTag;
use crate::router::Envelope;
use crate::router::EventRouter;
use crate::scheduler::TaskHandle;
use crate::stats::ResilienceStats;
use crate::stats::StatsSnapshot;
use crate::tasks::StartOutcome;
use crate::tasks::TaskContext;
use crate::topology::PoolTopology;
use crate::topology::TopologyView;
use crate::types::EventKind;
use crate::watchdog::Watchdog;

/// A running resilience engine.
pub struct ResilienceService {
    ctx: Arc<TaskContext>,
    guard: Arc<MessageGuard>,
    router: Arc<EventRouter>,
    watchdog: Arc<Watchdog>,
    stats: Arc<ResilienceStats>,
    background: Mutex<Vec<TaskHandle>>,
}

impl ResilienceService {
    /// Build an engine. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: ResilienceConfig,
        topology: PoolTopology,
        namespace: Arc<dyn NamespaceClient>,
        pools: Arc<dyn PoolClient>,
        alarms: Arc<dyn AlarmSink>,
    ) -> Result<Self> {
        config.validate().map_err(|e| ResilienceError::Configuration { message: e.to_string() })?;

        let stats = Arc::new(ResilienceStats::default());
        let guard = Arc::new(MessageGuard::new(config.startup_delay(), Arc::clone(&stats)));
        let pool_down_grace = config.pool_down_grace();
        let watchdog_interval = config.watchdog_interval();
        let watchdog_initial_delay = config.watchdog_initial_delay();
        let watchdog_enabled = config.watchdog_enabled;

        let ctx = Arc::new(TaskContext::new(
            config,
            Arc::new(TopologyView::new(topology)),
            namespace,
            pools,
            alarms,
            Arc::clone(&stats),
            guard.session(),
        ));
        let router = Arc::new(EventRouter::new(Arc::clone(&ctx), Arc::clone(&guard), pool_down_grace));
        let watchdog =
            Arc::new(Watchdog::new(Arc::clone(&ctx), watchdog_interval, watchdog_initial_delay, watchdog_enabled));

        Ok(Self {
            ctx,
            guard,
            router,
            watchdog,
            stats,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start the watchdog loop and, if configured, periodic checkpoints.
    pub fn start(&self) {
        let mut background = self.background.lock();
        background.push(self.watchdog.spawn());

        if let Some(path) = self.ctx.config.checkpoint_path.clone() {
            let registry = Arc::clone(&self.ctx.registry);
            let interval = self.ctx.config.checkpoint_interval();
            background.push(self.ctx.scheduler.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = write_checkpoint(&registry, &path) {
                        warn!(path = %path.display(), error = %e, "periodic checkpoint failed");
                    }
                }
            }));
        }
        info!(
            session = %self.guard.session(),
            watchdog = self.ctx.config.watchdog_enabled,
            checkpoint = ?self.ctx.config.checkpoint_path,
            "resilience engine started"
        );
    }

    /// Drain `events` into the router until the channel closes or the
    /// engine shuts down.
    pub fn run_events(&self, mut events: mpsc::UnboundedReceiver<Envelope>) -> TaskHandle {
        let router = Arc::clone(&self.router);
        self.ctx.scheduler.spawn(async move {
            while let Some(envelope) = events.recv().await {
                let name = envelope.event.name();
                if let Err(e) = router.dispatch(envelope) {
                    error!(event = name, error = %e, "event handling failed");
                }
            }
            debug!("event channel closed");
        })
    }

    /// Handle one event. Returns false if the guard dropped it.
    pub fn dispatch(&self, envelope: Envelope) -> Result<bool> {
        self.router.dispatch(envelope)
    }

    /// Re-enter every operation of a checkpoint into management.
    ///
    /// Records whose group is no longer resilient are dropped. Returns the
    /// number of operations started.
    pub fn restore_checkpoint(&self, path: &Path) -> Result<usize> {
        let records = read_checkpoint(path)?;
        let topology = self.ctx.topology.snapshot();
        let mut started = 0;
        for record in records {
            if !topology.group(&record.pool_group).is_some_and(|g| g.is_resilient()) {
                debug!(file = %record.file_id, group = %record.pool_group, "group no longer resilient, dropping record");
                continue;
            }
            let outcome = self.ctx.start_operation(
                record.file_id,
                &record.pool_group,
                record.source,
                EventKind::Indeterminate,
                record.excluded_pools,
            );
            if outcome == StartOutcome::Started {
                started += 1;
            }
        }
        info!(path = %path.display(), started, "checkpoint restored");
        Ok(started)
    }

    /// Write a checkpoint now, if a path is configured.
    pub fn checkpoint(&self) -> Result<Option<usize>> {
        match &self.ctx.config.checkpoint_path {
            Some(path) => write_checkpoint(&self.ctx.registry, path).map(Some),
            None => Ok(None),
        }
    }

    /// Operator surface.
    pub fn admin(&self) -> ResilienceAdmin {
        ResilienceAdmin::new(Arc::clone(&self.ctx), Arc::clone(&self.guard), Arc::clone(&self.watchdog))
    }

    /// Task context shared by every task of this engine.
    pub fn context(&self) -> &Arc<TaskContext> {
        &self.ctx
    }

    /// Event router.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Inbound event guard.
    pub fn guard(&self) -> &Arc<MessageGuard> {
        &self.guard
    }

    /// Periodic scanner.
    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    /// Session tag of this engine.
    pub fn session(&self) -> SessionTag {
        self.guard.session()
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.ctx.registry.len())
    }

    /// Stop background loops, write a final checkpoint, and drain every task.
    pub async fn shutdown(&self) {
        info!(operations = self.ctx.registry.len(), "shutting down resilience engine");
        self.watchdog.cancel_current();
        for handle in self.background.lock().drain(..) {
            handle.cancel();
        }
        if let Err(e) = self.checkpoint() {
            warn!(error = %e, "final checkpoint failed");
        }
        self.ctx.scheduler.shutdown().await;
        info!("resilience engine stopped");
    }
}
