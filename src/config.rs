//! Engine configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::constants::DEFAULT_CHECKPOINT_INTERVAL;
use crate::constants::DEFAULT_MAX_JOB_RETRIES;
use crate::constants::DEFAULT_POOL_DOWN_GRACE;
use crate::constants::DEFAULT_REQUEST_TIMEOUT;
use crate::constants::DEFAULT_REQUEST_WORKERS;
use crate::constants::DEFAULT_SCAN_WORKERS;
use crate::constants::DEFAULT_STARTUP_DELAY;
use crate::constants::DEFAULT_VERIFY_WORKERS;
use crate::constants::DEFAULT_WATCHDOG_INITIAL_DELAY;
use crate::constants::DEFAULT_WATCHDOG_INTERVAL;
use crate::constants::MAX_WORKERS_PER_CATEGORY;
use crate::scheduler::WorkerSizes;

/// Configuration of the resilience engine.
///
/// Configuration is loaded in layers with the following precedence (lowest to highest):
/// 1. Environment variables (ASPEN_RESILIENCE_*)
/// 2. TOML configuration file
/// 3. Command-line arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Concurrent pool scans per group.
    #[serde(default = "default_scan_workers")]
    pub scan_workers: u32,

    /// Concurrent file verifications per group.
    #[serde(default = "default_verify_workers")]
    pub verify_workers: u32,

    /// Concurrent copy/remove requests per group.
    #[serde(default = "default_request_workers")]
    pub request_workers: u32,

    /// Size requests against the far bound (maximum when deficient, minimum
    /// when redundant) instead of the near one.
    #[serde(default)]
    pub greedy_requests: bool,

    /// Per-group overrides of `greedy_requests`.
    #[serde(default)]
    pub greedy_overrides: BTreeMap<String, bool>,

    /// Warm-up interval after start during which inbound events are dropped (seconds).
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,

    /// Bound on every namespace/pool round-trip (milliseconds).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Whether the periodic scanner runs.
    #[serde(default = "default_watchdog_enabled")]
    pub watchdog_enabled: bool,

    /// Period between watchdog passes (seconds).
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,

    /// Delay before the first watchdog pass (seconds).
    #[serde(default = "default_watchdog_initial_delay_secs")]
    pub watchdog_initial_delay_secs: u64,

    /// Grace period before a pool that went down is scanned (seconds).
    #[serde(default = "default_pool_down_grace_secs")]
    pub pool_down_grace_secs: u64,

    /// Failed copy jobs tolerated per operation before it is given up.
    #[serde(default = "default_max_job_retries")]
    pub max_job_retries: u32,

    /// Where the registry is checkpointed. No checkpoint when unset.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,

    /// Period between checkpoints (seconds).
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            scan_workers: default_scan_workers(),
            verify_workers: default_verify_workers(),
            request_workers: default_request_workers(),
            greedy_requests: false,
            greedy_overrides: BTreeMap::new(),
            startup_delay_secs: default_startup_delay_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            watchdog_enabled: default_watchdog_enabled(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            watchdog_initial_delay_secs: default_watchdog_initial_delay_secs(),
            pool_down_grace_secs: default_pool_down_grace_secs(),
            max_job_retries: default_max_job_retries(),
            checkpoint_path: None,
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
        }
    }
}

impl ResilienceConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load configuration from environment variables.
    ///
    /// Variables follow the pattern ASPEN_RESILIENCE_<FIELD_NAME> (uppercase).
    /// Greedy overrides are written as `group=true,other=false`.
    pub fn from_env() -> Self {
        Self {
            scan_workers: parse_env("ASPEN_RESILIENCE_SCAN_WORKERS").unwrap_or_else(default_scan_workers),
            verify_workers: parse_env("ASPEN_RESILIENCE_VERIFY_WORKERS").unwrap_or_else(default_verify_workers),
            request_workers: parse_env("ASPEN_RESILIENCE_REQUEST_WORKERS").unwrap_or_else(default_request_workers),
            greedy_requests: parse_env("ASPEN_RESILIENCE_GREEDY_REQUESTS").unwrap_or(false),
            greedy_overrides: parse_env_map("ASPEN_RESILIENCE_GREEDY_OVERRIDES"),
            startup_delay_secs: parse_env("ASPEN_RESILIENCE_STARTUP_DELAY_SECS")
                .unwrap_or_else(default_startup_delay_secs),
            request_timeout_ms: parse_env("ASPEN_RESILIENCE_REQUEST_TIMEOUT_MS")
                .unwrap_or_else(default_request_timeout_ms),
            watchdog_enabled: parse_env("ASPEN_RESILIENCE_WATCHDOG_ENABLED").unwrap_or_else(default_watchdog_enabled),
            watchdog_interval_secs: parse_env("ASPEN_RESILIENCE_WATCHDOG_INTERVAL_SECS")
                .unwrap_or_else(default_watchdog_interval_secs),
            watchdog_initial_delay_secs: parse_env("ASPEN_RESILIENCE_WATCHDOG_INITIAL_DELAY_SECS")
                .unwrap_or_else(default_watchdog_initial_delay_secs),
            pool_down_grace_secs: parse_env("ASPEN_RESILIENCE_POOL_DOWN_GRACE_SECS")
                .unwrap_or_else(default_pool_down_grace_secs),
            max_job_retries: parse_env("ASPEN_RESILIENCE_MAX_JOB_RETRIES").unwrap_or_else(default_max_job_retries),
            checkpoint_path: parse_env("ASPEN_RESILIENCE_CHECKPOINT_PATH"),
            checkpoint_interval_secs: parse_env("ASPEN_RESILIENCE_CHECKPOINT_INTERVAL_SECS")
                .unwrap_or_else(default_checkpoint_interval_secs),
        }
    }

    /// Merge configuration from another source.
    ///
    /// Fields in `other` that are `Some` or non-default override fields in `self`.
    pub fn merge(&mut self, other: Self) {
        if other.scan_workers != default_scan_workers() {
            self.scan_workers = other.scan_workers;
        }
        if other.verify_workers != default_verify_workers() {
            self.verify_workers = other.verify_workers;
        }
        if other.request_workers != default_request_workers() {
            self.request_workers = other.request_workers;
        }
        if other.greedy_requests {
            self.greedy_requests = true;
        }
        self.greedy_overrides.extend(other.greedy_overrides);
        if other.startup_delay_secs != default_startup_delay_secs() {
            self.startup_delay_secs = other.startup_delay_secs;
        }
        if other.request_timeout_ms != default_request_timeout_ms() {
            self.request_timeout_ms = other.request_timeout_ms;
        }
        if other.watchdog_enabled != default_watchdog_enabled() {
            self.watchdog_enabled = other.watchdog_enabled;
        }
        if other.watchdog_interval_secs != default_watchdog_interval_secs() {
            self.watchdog_interval_secs = other.watchdog_interval_secs;
        }
        if other.watchdog_initial_delay_secs != default_watchdog_initial_delay_secs() {
            self.watchdog_initial_delay_secs = other.watchdog_initial_delay_secs;
        }
        if other.pool_down_grace_secs != default_pool_down_grace_secs() {
            self.pool_down_grace_secs = other.pool_down_grace_secs;
        }
        if other.max_job_retries != default_max_job_retries() {
            self.max_job_retries = other.max_job_retries;
        }
        if other.checkpoint_path.is_some() {
            self.checkpoint_path = other.checkpoint_path;
        }
        if other.checkpoint_interval_secs != default_checkpoint_interval_secs() {
            self.checkpoint_interval_secs = other.checkpoint_interval_secs;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("scan_workers", self.scan_workers),
            ("verify_workers", self.verify_workers),
            ("request_workers", self.request_workers),
        ] {
            if value == 0 || value > MAX_WORKERS_PER_CATEGORY {
                return Err(ConfigError::Validation {
                    message: format!("{name} must be between 1 and {MAX_WORKERS_PER_CATEGORY}"),
                });
            }
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                message: "request_timeout_ms must be non-zero".into(),
            });
        }

        if self.watchdog_enabled && self.watchdog_interval_secs == 0 {
            return Err(ConfigError::Validation {
                message: "watchdog_interval_secs must be non-zero when the watchdog is enabled".into(),
            });
        }

        if self.checkpoint_path.is_some() && self.checkpoint_interval_secs == 0 {
            return Err(ConfigError::Validation {
                message: "checkpoint_interval_secs must be non-zero when checkpointing".into(),
            });
        }

        Ok(())
    }

    /// Whether requests for `group` are sized greedily.
    pub fn is_greedy(&self, group: &str) -> bool {
        self.greedy_overrides.get(group).copied().unwrap_or(self.greedy_requests)
    }

    /// Worker pool sizes.
    pub fn worker_sizes(&self) -> WorkerSizes {
        WorkerSizes {
            scan: self.scan_workers,
            verify: self.verify_workers,
            request: self.request_workers,
        }
    }

    /// Warm-up interval.
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    /// Round-trip bound.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Watchdog period.
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    /// Delay before the first watchdog pass.
    pub fn watchdog_initial_delay(&self) -> Duration {
        Duration::from_secs(self.watchdog_initial_delay_secs)
    }

    /// Grace period for pools that went down.
    pub fn pool_down_grace(&self) -> Duration {
        Duration::from_secs(self.pool_down_grace_secs)
    }

    /// Checkpoint period.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

fn default_scan_workers() -> u32 {
    DEFAULT_SCAN_WORKERS
}

fn default_verify_workers() -> u32 {
    DEFAULT_VERIFY_WORKERS
}

fn default_request_workers() -> u32 {
    DEFAULT_REQUEST_WORKERS
}

fn default_startup_delay_secs() -> u64 {
    DEFAULT_STARTUP_DELAY.as_secs()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

fn default_watchdog_enabled() -> bool {
    true
}

fn default_watchdog_interval_secs() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL.as_secs()
}

fn default_watchdog_initial_delay_secs() -> u64 {
    DEFAULT_WATCHDOG_INITIAL_DELAY.as_secs()
}

fn default_pool_down_grace_secs() -> u64 {
    DEFAULT_POOL_DOWN_GRACE.as_secs()
}

fn default_max_job_retries() -> u32 {
    DEFAULT_MAX_JOB_RETRIES
}

fn default_checkpoint_interval_secs() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL.as_secs()
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn parse_env_map(key: &str) -> BTreeMap<String, bool> {
    std::env::var(key)
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|pair| {
                    let (group, value) = pair.split_once('=')?;
                    Some((group.trim().to_string(), value.trim().parse().ok()?))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Configuration loading errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}
