//! Inbound event guard.
//!
//! Every request the engine sends (remove replica, clear location, copy)
//! carries this instance's [`SessionTag`]. Events caused by those requests
//! come back carrying the same tag and are dropped, which breaks the
//! feedback loop where the engine reacts to its own work.
//!
//! The guard also suppresses all inbound events for a warm-up interval after
//! start, and while an operator has disabled the engine.
//!
//! # Tiger Style
//!
//! - Rejection never mutates engine state
//! - The session tag is fixed for the life of the guard

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::router::Envelope;
use crate::stats::Counter;
use crate::stats::ResilienceStats;

/// Identity of one running engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionTag(Uuid);

impl SessionTag {
    /// Fresh random tag.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionTag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Filters inbound events before they reach the router.
#[derive(Debug)]
pub struct MessageGuard {
    session: SessionTag,
    started_at: Instant,
    startup_delay: Duration,
    enabled: AtomicBool,
    stats: Arc<ResilienceStats>,
}

impl MessageGuard {
    /// Create a guard with a fresh session tag; the warm-up starts now.
    pub fn new(startup_delay: Duration, stats: Arc<ResilienceStats>) -> Self {
        Self {
            session: SessionTag::new(),
            started_at: Instant::now(),
            startup_delay,
            enabled: AtomicBool::new(true),
            stats,
        }
    }

    /// This instance's tag.
    pub fn session(&self) -> SessionTag {
        self.session
    }

    /// Whether inbound events are currently let through at all.
    pub fn is_open(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && self.started_at.elapsed() >= self.startup_delay
    }

    /// Let events through again after [`disable`](Self::disable).
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::AcqRel) {
            info!(session = %self.session, "message handling enabled");
        }
    }

    /// Drop every inbound event until re-enabled.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            info!(session = %self.session, "message handling disabled");
        }
    }

    /// Whether an event should be handled.
    ///
    /// Events tagged with our own session are rejected. Accepted events are
    /// stamped with our tag so every request issued while handling them
    /// carries it.
    pub fn accept(&self, envelope: &mut Envelope) -> bool {
        if envelope.session == Some(self.session) {
            self.stats.incr(Counter::EventsRejectedSelf);
            debug!(event = envelope.event.name(), "dropping event caused by this engine");
            return false;
        }
        if !self.is_open() {
            self.stats.incr(Counter::EventsRejectedGate);
            debug!(event = envelope.event.name(), "dropping event, message handling is closed");
            return false;
        }
        envelope.session = Some(self.session);
        self.stats.incr(Counter::EventsAccepted);
        true
    }
}
