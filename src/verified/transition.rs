//! Operation state transitions.
//!
//! [`apply_transition`] is the whole per-key state machine of the registry
//! expressed as a function from the current state and an event to a new
//! state plus a [`Decision`] telling the registry what to do with its entry.
//! The registry applies the decision under its lock; nothing here touches
//! shared state.

use std::collections::BTreeSet;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use super::choose_source;
use super::is_satisfied;
use super::mode_for_delta;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::types::JobOutcome;
use crate::types::OperationMode;

/// Mutable bookkeeping of one file operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationState {
    /// Whether a verification has computed the delta.
    pub verified: bool,
    /// Signed replica delta; negative is deficient, positive is redundant.
    pub replica_delta: i64,
    /// Replica count when the delta was computed.
    pub original_count: u32,
    /// Pools believed to hold a durable replica.
    pub known_locations: BTreeSet<String>,
    /// Completion acknowledgements received for the active request.
    pub acknowledgements: u32,
    /// Copies or removals requested by the active task.
    pub requested: u32,
    /// Failed copy jobs seen so far.
    pub failures: u32,
    /// A retryable failure left the operation waiting for a new trigger.
    pub stalled: bool,
    /// Source actually used by the last copy request.
    pub copy_source: Option<String>,
    /// Identifier of the last copy job.
    pub job_id: Option<String>,
    /// Pools whose replica was reported corrupt; never counted again.
    #[serde(default)]
    pub corrupt_pools: BTreeSet<String>,
}

impl OperationState {
    /// Derived mode.
    pub fn mode(&self) -> OperationMode {
        mode_for_delta(self.verified, self.replica_delta)
    }

    /// Whether the outstanding need has been met.
    pub fn is_satisfied(&self) -> bool {
        self.verified && is_satisfied(self.original_count, self.known_locations.len(), self.replica_delta)
    }

    /// Record the outcome of a verification.
    pub fn record_verification(&mut self, known_locations: BTreeSet<String>, delta: i64) {
        self.original_count = u32::try_from(known_locations.len()).unwrap_or(u32::MAX);
        self.known_locations = known_locations;
        self.replica_delta = delta;
        self.verified = true;
        self.acknowledgements = 0;
        self.requested = 0;
        self.stalled = false;
    }

    /// Forget everything a verification computed, keeping the failure count
    /// and the corrupt pools.
    pub fn reset_for_verification(&self) -> Self {
        Self {
            failures: self.failures,
            corrupt_pools: self.corrupt_pools.clone(),
            ..Self::default()
        }
    }

    /// Re-anchor the delta on the current known locations.
    ///
    /// The target count `original_count - replica_delta` is preserved.
    fn rebase(&mut self) {
        let target = i64::from(self.original_count) - self.replica_delta;
        let known = u32::try_from(self.known_locations.len()).unwrap_or(u32::MAX);
        self.replica_delta = i64::from(known) - target;
        self.original_count = known;
    }
}

/// Event applied to a registered operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEvent {
    /// The namespace reported a new replica on `pool`.
    LocationAdded {
        /// Pool holding the new replica.
        pool: String,
    },
    /// The namespace reported that `pool` no longer holds a replica.
    LocationCleared {
        /// Pool that lost its replica.
        pool: String,
    },
    /// The replica on `pool` is corrupt.
    Corrupt {
        /// Pool holding the corrupt replica.
        pool: String,
    },
    /// A reduce request removed the replica from `pool`.
    ReplicaRemoved {
        /// Pool the replica was removed from.
        pool: String,
    },
    /// A copy job reported its status.
    Acknowledged {
        /// Job outcome.
        outcome: JobOutcome,
        /// Pool the job wrote to (or found corrupt).
        pool: Option<String>,
    },
    /// A new trigger (event or scan) hit an already registered operation.
    Retrigger,
}

/// Why an operation leaves the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// The replica count is within bounds.
    Satisfied,
    /// No replica is left to copy from.
    Unreachable,
    /// Verification found no durable replica at all.
    Lost,
    /// Copy jobs kept failing.
    Failed,
    /// The copy job was cancelled.
    Cancelled,
    /// The file needs no management.
    NotRequired,
    /// The file or its group disappeared.
    NotFound,
    /// An operator cancelled the operation.
    Operator,
}

/// What the registry must do with its entry after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Store the new state in the existing entry.
    Keep,
    /// Replace the entry with a clone using `new_source`; resubmit a copy.
    Replace {
        /// Pool the clone copies from.
        new_source: String,
    },
    /// Drop the entry.
    Remove(RemovalReason),
    /// Store the new state and resubmit a verification.
    Resubmit,
}

/// Tunables of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// Failed copy jobs tolerated before the operation is given up.
    pub max_job_retries: u32,
}

/// Result of applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the event.
    pub state: OperationState,
    /// What the registry must do.
    pub decision: Decision,
}

impl Transition {
    fn keep(state: OperationState) -> Self {
        Self {
            state,
            decision: Decision::Keep,
        }
    }

    fn with(state: OperationState, decision: Decision) -> Self {
        Self { state, decision }
    }
}

/// Apply `event` to an operation whose effective copy source is `source`.
///
/// Returns [`ResilienceError::Bug`] if a verified operation with mode NONE
/// receives an update: such operations are removed at verification time and
/// must never be observed in the registry.
pub fn apply_transition<R: Rng + ?Sized>(
    state: &OperationState,
    source: Option<&str>,
    event: &TransitionEvent,
    policy: &TransitionPolicy,
    rng: &mut R,
) -> Result<Transition> {
    if let TransitionEvent::Retrigger = event {
        return Ok(if state.stalled {
            Transition::with(state.reset_for_verification(), Decision::Resubmit)
        } else {
            Transition::keep(state.clone())
        });
    }

    // Verification reads fresh locations from the namespace anyway.
    if !state.verified {
        return Ok(Transition::keep(state.clone()));
    }

    let mode = state.mode();
    if mode == OperationMode::None {
        return Err(ResilienceError::bug(format!("update {event:?} reached a verified operation with mode none")));
    }

    let mut next = state.clone();
    let transition = match event {
        TransitionEvent::LocationAdded { pool } => {
            if mode == OperationMode::Replicate && next.known_locations.insert(pool.clone()) && next.is_satisfied() {
                Transition::with(next, Decision::Remove(RemovalReason::Satisfied))
            } else {
                Transition::keep(next)
            }
        }
        TransitionEvent::Corrupt { pool } => {
            next.corrupt_pools.insert(pool.clone());
            remove_location(next, mode, pool, source, rng)
        }
        TransitionEvent::LocationCleared { pool } | TransitionEvent::ReplicaRemoved { pool } => {
            remove_location(next, mode, pool, source, rng)
        }
        TransitionEvent::Acknowledged { outcome, pool } => {
            if outcome.is_acknowledgement() {
                next.acknowledgements = next.acknowledgements.saturating_add(1);
            }
            match outcome {
                JobOutcome::InProgress => Transition::keep(next),
                JobOutcome::Succeeded | JobOutcome::Exists => {
                    if mode == OperationMode::Replicate {
                        if let Some(pool) = pool {
                            next.known_locations.insert(pool.clone());
                        }
                    }
                    if next.is_satisfied() {
                        Transition::with(next, Decision::Remove(RemovalReason::Satisfied))
                    } else if next.requested > 0 && next.acknowledgements >= next.requested {
                        // Every copy reported back and the count is still off.
                        Transition::with(next.reset_for_verification(), Decision::Resubmit)
                    } else {
                        Transition::keep(next)
                    }
                }
                JobOutcome::Failed => {
                    next.failures = next.failures.saturating_add(1);
                    if next.failures > policy.max_job_retries {
                        Transition::with(next, Decision::Remove(RemovalReason::Failed))
                    } else {
                        Transition::with(next.reset_for_verification(), Decision::Resubmit)
                    }
                }
                JobOutcome::Cancelled => Transition::with(next, Decision::Remove(RemovalReason::Cancelled)),
                JobOutcome::Corrupt => match pool {
                    Some(pool) => {
                        next.corrupt_pools.insert(pool.clone());
                        remove_location(next, mode, pool, source, rng)
                    }
                    None => Transition::keep(next),
                },
            }
        }
        TransitionEvent::Retrigger => Transition::keep(next),
    };
    Ok(transition)
}

fn remove_location<R: Rng + ?Sized>(
    mut next: OperationState,
    mode: OperationMode,
    pool: &str,
    source: Option<&str>,
    rng: &mut R,
) -> Transition {
    next.known_locations.remove(pool);
    match mode {
        OperationMode::Reduce => {
            if next.is_satisfied() {
                Transition::with(next, Decision::Remove(RemovalReason::Satisfied))
            } else {
                Transition::keep(next)
            }
        }
        OperationMode::Replicate if source == Some(pool) => match choose_source(&next.known_locations, rng) {
            None => Transition::with(next, Decision::Remove(RemovalReason::Unreachable)),
            Some(new_source) => {
                next.rebase();
                next.acknowledgements = 0;
                next.requested = 0;
                next.copy_source = Some(new_source.clone());
                next.job_id = None;
                Transition::with(next, Decision::Replace { new_source })
            }
        },
        _ => Transition::keep(next),
    }
}
