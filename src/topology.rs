//! Pool topology: pools, hosts, pool groups, storage units and links.
//!
//! The engine reads topology through [`TopologyView`], which hands out
//! immutable [`PoolTopology`] snapshots. Status changes and reloads build a
//! new snapshot and swap it in, so a scan or verification that grabbed a
//! snapshot keeps a consistent view for its whole run.
//!
//! # Tiger Style
//!
//! - Snapshots are `Arc`-shared and never mutated in place
//! - Validation happens once, when a snapshot is built
//! - A pool belongs to at most one resilient group

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ResilienceError;
use crate::error::Result;

/// A storage node holding file replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Pool name.
    pub name: String,
    /// Physical host the pool runs on.
    pub host: String,
    /// Whether the pool is currently serving.
    #[serde(default = "default_active")]
    pub active: bool,
}

/// A group of pools sharing one replica-count policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolGroupConfig {
    /// Group name.
    pub name: String,
    /// Member pool names.
    #[serde(default)]
    pub pools: Vec<String>,
    /// Default minimum number of durable replicas.
    #[serde(default = "default_one")]
    pub minimum: u32,
    /// Default maximum number of durable replicas.
    #[serde(default = "default_one")]
    pub maximum: u32,
    /// Whether two replicas may live on pools of the same host.
    #[serde(default)]
    pub same_host_allowed: bool,
}

impl PoolGroupConfig {
    /// A group needs replica management when it asks for more than one copy.
    pub fn is_resilient(&self) -> bool {
        self.minimum > 1
    }
}

/// A storage unit (`storage_class[@hsm]`) overriding group bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnit {
    /// Unit key, `storage_class[@hsm]`.
    pub name: String,
    /// Minimum number of durable replicas.
    pub minimum: u32,
    /// Maximum number of durable replicas.
    pub maximum: u32,
    /// Whether two replicas may live on pools of the same host.
    #[serde(default)]
    pub same_host_allowed: bool,
}

/// Association between storage units and the pool groups that store them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link name.
    pub name: String,
    /// Target pool groups.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Storage units routed through this link.
    #[serde(default)]
    pub units: Vec<String>,
}

/// Serialized topology description (TOML or JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Pools.
    #[serde(default)]
    pub pools: Vec<PoolInfo>,
    /// Pool groups.
    #[serde(default)]
    pub groups: Vec<PoolGroupConfig>,
    /// Storage units.
    #[serde(default)]
    pub units: Vec<StorageUnit>,
    /// Links.
    #[serde(default)]
    pub links: Vec<Link>,
}

impl TopologyConfig {
    /// Parse a topology description from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ResilienceError::Configuration {
            message: format!("invalid topology: {e}"),
        })
    }
}

/// Read-only view of one pool group at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolGroupView {
    /// Group name.
    pub name: String,
    /// All member pools.
    pub pools: BTreeSet<String>,
    /// Members that are currently active.
    pub active_pools: BTreeSet<String>,
    /// Whether the group requires replica management.
    pub resilient: bool,
    /// Storage units reachable through links targeting the group.
    pub storage_units: BTreeSet<String>,
}

/// Immutable topology snapshot.
#[derive(Debug, Clone, Default)]
pub struct PoolTopology {
    pools: BTreeMap<String, PoolInfo>,
    groups: BTreeMap<String, PoolGroupConfig>,
    units: BTreeMap<String, StorageUnit>,
    links: Vec<Link>,
}

impl PoolTopology {
    /// Build and validate a snapshot from its serialized description.
    pub fn from_config(config: TopologyConfig) -> Result<Self> {
        let mut topology = PoolTopology::default();

        for pool in config.pools {
            if topology.pools.insert(pool.name.clone(), pool.clone()).is_some() {
                return Err(configuration(format!("duplicate pool {}", pool.name)));
            }
        }
        for unit in config.units {
            validate_bounds(&unit.name, unit.minimum, unit.maximum)?;
            topology.units.insert(unit.name.clone(), unit);
        }
        for group in config.groups {
            validate_bounds(&group.name, group.minimum, group.maximum)?;
            if let Some(missing) = group.pools.iter().find(|p| !topology.pools.contains_key(*p)) {
                return Err(configuration(format!("group {} references unknown pool {missing}", group.name)));
            }
            topology.groups.insert(group.name.clone(), group);
        }
        for link in &config.links {
            if let Some(missing) = link.groups.iter().find(|g| !topology.groups.contains_key(*g)) {
                return Err(configuration(format!("link {} references unknown group {missing}", link.name)));
            }
            if let Some(missing) = link.units.iter().find(|u| !topology.units.contains_key(*u)) {
                return Err(configuration(format!("link {} references unknown unit {missing}", link.name)));
            }
        }
        topology.links = config.links;
        topology.check_single_resilient_membership()?;

        Ok(topology)
    }

    /// Serialize the snapshot back into its description.
    pub fn to_config(&self) -> TopologyConfig {
        TopologyConfig {
            pools: self.pools.values().cloned().collect(),
            groups: self.groups.values().cloned().collect(),
            units: self.units.values().cloned().collect(),
            links: self.links.clone(),
        }
    }

    /// Look up a pool.
    pub fn pool(&self, name: &str) -> Option<&PoolInfo> {
        self.pools.get(name)
    }

    /// Look up a pool group.
    pub fn group(&self, name: &str) -> Option<&PoolGroupConfig> {
        self.groups.get(name)
    }

    /// Look up a storage unit by its `storage_class[@hsm]` key.
    pub fn storage_unit(&self, key: &str) -> Option<&StorageUnit> {
        self.units.get(key)
    }

    /// Host of a pool.
    pub fn host_of(&self, pool: &str) -> Option<&str> {
        self.pools.get(pool).map(|p| p.host.as_str())
    }

    /// Whether a pool is known and active.
    pub fn is_active(&self, pool: &str) -> bool {
        self.pools.get(pool).is_some_and(|p| p.active)
    }

    /// All pool groups.
    pub fn groups(&self) -> impl Iterator<Item = &PoolGroupConfig> {
        self.groups.values()
    }

    /// Names of groups that require replica management.
    pub fn resilient_groups(&self) -> Vec<String> {
        self.groups.values().filter(|g| g.is_resilient()).map(|g| g.name.clone()).collect()
    }

    /// The resilient group a pool belongs to, if any.
    pub fn resilient_group_of(&self, pool: &str) -> Option<&PoolGroupConfig> {
        self.groups.values().find(|g| g.is_resilient() && g.pools.iter().any(|p| p == pool))
    }

    /// Storage units reachable through any link that targets `group`.
    pub fn units_linked_to(&self, group: &str) -> Vec<&StorageUnit> {
        let names: BTreeSet<&String> = self
            .links
            .iter()
            .filter(|l| l.groups.iter().any(|g| g == group))
            .flat_map(|l| l.units.iter())
            .collect();
        names.into_iter().filter_map(|n| self.units.get(n)).collect()
    }

    /// Build the read-only view of a group.
    pub fn group_view(&self, name: &str) -> Option<PoolGroupView> {
        let group = self.groups.get(name)?;
        let pools: BTreeSet<String> = group.pools.iter().cloned().collect();
        let active_pools = pools.iter().filter(|p| self.is_active(p)).cloned().collect();
        let storage_units = self.units_linked_to(name).into_iter().map(|u| u.name.clone()).collect();
        Some(PoolGroupView {
            name: group.name.clone(),
            pools,
            active_pools,
            resilient: group.is_resilient(),
            storage_units,
        })
    }

    /// Active pools across all resilient groups, with their group.
    pub fn active_resilient_pools(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for group in self.groups.values().filter(|g| g.is_resilient()) {
            for pool in group.pools.iter().filter(|p| self.is_active(p)) {
                out.push((pool.clone(), group.name.clone()));
            }
        }
        out
    }

    fn with_pool_active(&self, pool: &str, active: bool) -> Result<Self> {
        let mut next = self.clone();
        let info = next.pools.get_mut(pool).ok_or_else(|| ResilienceError::not_found("pool", pool))?;
        info.active = active;
        Ok(next)
    }

    fn with_membership(&self, pool: &str, group: &str, member: bool) -> Result<Self> {
        if !self.pools.contains_key(pool) {
            return Err(ResilienceError::not_found("pool", pool));
        }
        let mut next = self.clone();
        let entry = next.groups.get_mut(group).ok_or_else(|| ResilienceError::not_found("pool group", group))?;
        if member {
            if !entry.pools.iter().any(|p| p == pool) {
                entry.pools.push(pool.to_string());
            }
        } else {
            entry.pools.retain(|p| p != pool);
        }
        next.check_single_resilient_membership()?;
        Ok(next)
    }

    fn check_single_resilient_membership(&self) -> Result<()> {
        let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
        for group in self.groups.values().filter(|g| g.is_resilient()) {
            for pool in &group.pools {
                if let Some(previous) = owner.insert(pool, &group.name) {
                    return Err(configuration(format!(
                        "pool {pool} belongs to resilient groups {previous} and {}",
                        group.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Shared, swappable handle to the current topology snapshot.
#[derive(Debug, Default)]
pub struct TopologyView {
    current: RwLock<Arc<PoolTopology>>,
}

impl TopologyView {
    /// Wrap an initial snapshot.
    pub fn new(topology: PoolTopology) -> Self {
        Self {
            current: RwLock::new(Arc::new(topology)),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<PoolTopology> {
        Arc::clone(&self.current.read())
    }

    /// Replace the snapshot wholesale, invalidating cached group views.
    pub fn reload(&self, topology: PoolTopology) {
        *self.current.write() = Arc::new(topology);
    }

    /// Mark a pool active or inactive.
    ///
    /// Returns true if the status actually changed.
    pub fn set_pool_active(&self, pool: &str, active: bool) -> Result<bool> {
        let mut current = self.current.write();
        if current.pool(pool).is_some_and(|p| p.active == active) {
            return Ok(false);
        }
        *current = Arc::new(current.with_pool_active(pool, active)?);
        Ok(true)
    }

    /// Add a pool to a group.
    pub fn add_pool_to_group(&self, pool: &str, group: &str) -> Result<()> {
        let mut current = self.current.write();
        *current = Arc::new(current.with_membership(pool, group, true)?);
        Ok(())
    }

    /// Remove a pool from a group.
    pub fn remove_pool_from_group(&self, pool: &str, group: &str) -> Result<()> {
        let mut current = self.current.write();
        *current = Arc::new(current.with_membership(pool, group, false)?);
        Ok(())
    }
}

fn validate_bounds(name: &str, minimum: u32, maximum: u32) -> Result<()> {
    if minimum < 1 {
        return Err(configuration(format!("{name}: minimum must be at least 1")));
    }
    if maximum < minimum {
        return Err(configuration(format!("{name}: maximum {maximum} is below minimum {minimum}")));
    }
    Ok(())
}

fn configuration(message: String) -> ResilienceError {
    ResilienceError::Configuration { message }
}

fn default_active() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> TopologyConfig {
        TopologyConfig::from_toml_str(
            r#"
            [[pools]]
            name = "p1"
            host = "h1"

            [[pools]]
            name = "p2"
            host = "h2"

            [[pools]]
            name = "p3"
            host = "h2"
            active = false

            [[groups]]
            name = "resilient"
            pools = ["p1", "p2", "p3"]
            minimum = 2
            maximum = 3

            [[groups]]
            name = "cache"
            pools = ["p1"]

            [[units]]
            name = "exp:raw@osm"
            minimum = 3
            maximum = 3

            [[links]]
            name = "raw-link"
            groups = ["resilient"]
            units = ["exp:raw@osm"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_group_view() {
        let topology = PoolTopology::from_config(sample_config()).unwrap();
        let view = topology.group_view("resilient").unwrap();

        assert!(view.resilient);
        assert_eq!(view.pools.len(), 3);
        assert_eq!(view.active_pools, BTreeSet::from(["p1".to_string(), "p2".to_string()]));
        assert!(view.storage_units.contains("exp:raw@osm"));

        assert!(!topology.group_view("cache").unwrap().resilient);
        assert!(topology.group_view("missing").is_none());
    }

    #[test]
    fn test_resilient_group_of() {
        let topology = PoolTopology::from_config(sample_config()).unwrap();
        assert_eq!(topology.resilient_group_of("p1").map(|g| g.name.as_str()), Some("resilient"));
        assert!(topology.resilient_group_of("unknown").is_none());
    }

    #[test]
    fn test_rejects_double_resilient_membership() {
        let mut config = sample_config();
        config.groups.push(PoolGroupConfig {
            name: "second".into(),
            pools: vec!["p2".into()],
            minimum: 2,
            maximum: 2,
            same_host_allowed: false,
        });
        assert!(matches!(PoolTopology::from_config(config), Err(ResilienceError::Configuration { .. })));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let mut config = sample_config();
        config.units[0].maximum = 1;
        assert!(PoolTopology::from_config(config).is_err());
    }

    #[test]
    fn test_view_status_changes_swap_snapshot() {
        let view = TopologyView::new(PoolTopology::from_config(sample_config()).unwrap());
        let before = view.snapshot();

        assert!(view.set_pool_active("p3", true).unwrap());
        assert!(!view.set_pool_active("p3", true).unwrap());

        assert!(!before.is_active("p3"));
        assert!(view.snapshot().is_active("p3"));
        assert!(view.set_pool_active("nope", false).unwrap_err().is_not_found());
    }

    #[test]
    fn test_membership_changes() {
        let view = TopologyView::new(PoolTopology::from_config(sample_config()).unwrap());
        view.remove_pool_from_group("p2", "resilient").unwrap();
        assert!(view.snapshot().resilient_group_of("p2").is_none());

        view.add_pool_to_group("p2", "resilient").unwrap();
        assert!(view.snapshot().resilient_group_of("p2").is_some());
    }
}
