//! Aspen resilience binary - runs the replica-count engine over a simulated cluster.
//!
//! The engine is wired to the in-memory namespace and migration engine, seeded
//! with the files of a JSON inventory. Every resilient group is swept once,
//! the engine runs until no operation is left (or the time limit passes), and
//! the resulting statistics and replica locations are printed as JSON.
//!
//! Configuration layers: Environment < TOML < CLI args.
//!
//! # Inventory format
//!
//! One JSON object per line:
//!
//! ```text
//! {"file_id":"0001","locations":["p1"],"storage_class":"exp:raw","hsm":"osm"}
//! ```

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use aspen_resilience::FileId;
use aspen_resilience::PoolTopology;
use aspen_resilience::ResilienceConfig;
use aspen_resilience::ResilienceService;
use aspen_resilience::TopologyConfig;
use aspen_resilience::clients::LoggingAlarmSink;
use aspen_resilience::testing::InMemoryNamespace;
use aspen_resilience::testing::InMemoryPools;
use aspen_resilience::testing::wait_until;
use aspen_resilience::types::FileAttributes;
use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "aspen-resilience")]
#[command(about = "Keeps replica counts of resilient pool groups within bounds")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to TOML topology (pools, groups, units, links).
    #[arg(long)]
    topology: PathBuf,

    /// Path to the JSON-lines file inventory.
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Only check that every resilient group can meet its constraints.
    #[arg(long)]
    check_only: bool,

    /// Concurrent copy/remove requests per group.
    #[arg(long)]
    request_workers: Option<u32>,

    /// Size requests against the far bound.
    #[arg(long)]
    greedy: bool,

    /// Checkpoint file; restored at start, written at exit.
    #[arg(long, env = "ASPEN_RESILIENCE_CHECKPOINT_PATH")]
    checkpoint: Option<PathBuf>,

    /// Give up waiting for convergence after this many seconds.
    #[arg(long, default_value_t = 60)]
    time_limit_secs: u64,
}

#[derive(Debug, Deserialize)]
struct InventoryEntry {
    file_id: FileId,
    #[serde(default)]
    locations: Vec<String>,
    #[serde(default)]
    storage_class: Option<String>,
    #[serde(default)]
    hsm: Option<String>,
}

#[derive(Debug, Serialize)]
struct Report {
    converged: bool,
    stats: aspen_resilience::stats::StatsSnapshot,
    locations: BTreeMap<String, BTreeSet<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = build_config(&args)?;
    let topology_toml = std::fs::read_to_string(&args.topology)
        .with_context(|| format!("failed to read topology {}", args.topology.display()))?;
    let topology = PoolTopology::from_config(TopologyConfig::from_toml_str(&topology_toml)?)?;

    let namespace = Arc::new(InMemoryNamespace::default());
    let files = match &args.inventory {
        Some(path) => load_inventory(&namespace, path)?,
        None => Vec::new(),
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pools = Arc::new(InMemoryPools::new(Arc::clone(&namespace), topology.clone(), events_tx));
    let service =
        ResilienceService::new(config, topology.clone(), namespace.clone(), pools, Arc::new(LoggingAlarmSink))?;
    let admin = service.admin();

    let checks = admin.verify_constraints(None)?;
    for check in checks.iter().filter(|c| !c.is_ok()) {
        warn!(group = %check.group, problem = ?check.problem, "group cannot meet its constraints");
    }
    if args.check_only {
        println!("{}", serde_json::to_string_pretty(&checks)?);
        return Ok(());
    }

    service.start();
    service.run_events(events_rx);
    if let Some(path) = &args.checkpoint {
        service.restore_checkpoint(path)?;
    }

    for group in topology.resilient_groups() {
        for handle in admin.adjust_group(&group)? {
            handle.join().await;
        }
    }

    let limit = Duration::from_secs(args.time_limit_secs);
    let converged = wait_until(limit, || service.context().registry().is_empty()).await;
    if !converged {
        warn!(operations = service.context().registry().len(), "engine did not converge in time");
    }

    let report = Report {
        converged,
        stats: service.stats(),
        locations: files.iter().map(|f| (f.to_string(), namespace.locations(f))).collect(),
    };
    service.shutdown().await;
    info!(converged, "done");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Build configuration from environment, TOML file, and CLI arguments.
fn build_config(args: &Args) -> Result<ResilienceConfig> {
    let mut config = ResilienceConfig::from_env();
    if let Some(path) = &args.config {
        let file = ResilienceConfig::from_toml_file(path).context("failed to load configuration file")?;
        config.merge(file);
    }

    let mut cli = ResilienceConfig::default();
    if let Some(workers) = args.request_workers {
        cli.request_workers = workers;
    }
    cli.greedy_requests = args.greedy;
    cli.checkpoint_path = args.checkpoint.clone();
    // Nothing else talks to the simulated cluster, so there is nothing to wait for.
    cli.startup_delay_secs = 0;
    config.merge(cli);

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_inventory(namespace: &InMemoryNamespace, path: &Path) -> Result<Vec<FileId>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read inventory {}", path.display()))?;
    let mut files = Vec::new();
    for (index, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let entry: InventoryEntry =
            serde_json::from_str(line).with_context(|| format!("{}:{}: malformed entry", path.display(), index + 1))?;
        let mut attributes = FileAttributes::online(entry.file_id.clone());
        attributes.storage_class = entry.storage_class;
        attributes.hsm = entry.hsm;
        namespace.add_file(attributes, entry.locations.iter().map(String::as_str));
        files.push(entry.file_id);
    }
    info!(files = files.len(), "inventory loaded");
    Ok(files)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}
