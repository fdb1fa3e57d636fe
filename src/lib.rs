//! Replica-count resilience for Aspen storage pools.
//!
//! This crate keeps the number of durable replicas of every file stored in a
//! resilient pool group within the group's `[minimum, maximum]` bounds. It
//! reacts to replica location changes, pool status changes, group membership
//! changes and copy job reports, and sweeps every pool periodically to catch
//! anything the events missed.
//!
//! # Features
//!
//! - **Per-file operations**: one registry entry per (group, file), with a
//!   pure state machine deciding every update
//! - **Bounded workers**: per-group, per-category worker pools
//! - **Loop prevention**: session-tagged requests and an inbound guard
//! - **Watchdog**: sequential periodic scans of every resilient pool
//! - **Checkpoints**: registry contents survive a restart
//!
//! # Example
//!
//! ```ignore
//! use aspen_resilience::{ResilienceConfig, ResilienceService};
//!
//! let service = ResilienceService::new(config, topology, namespace, pools, alarms)?;
//! service.start();
//! service.run_events(events);
//! let stats = service.admin().stats();
//! ```

#![warn(missing_docs)]
#![allow(clippy::collapsible_if)]

pub mod admin;
pub mod checkpoint;
pub mod clients;
pub mod config;
pub mod constants;
pub mod constraints;
pub mod error;
pub mod guard;
pub mod operation;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod tasks;
pub mod testing;
pub mod topology;
pub mod types;
/// Verified pure functions for replica bookkeeping.
pub mod verified;
pub mod watchdog;

pub use admin::ResilienceAdmin;
pub use clients::AlarmSink;
pub use clients::NamespaceClient;
pub use clients::PoolClient;
pub use config::ResilienceConfig;
pub use error::ResilienceError;
pub use error::Result;
pub use guard::SessionTag;
pub use registry::OperationFilter;
pub use router::Envelope;
pub use router::ResilienceEvent;
pub use service::ResilienceService;
pub use topology::PoolTopology;
pub use topology::TopologyConfig;
pub use types::FileId;
pub use watchdog::WatchdogCommand;
