//! Replica-count constraints for files and pool groups.
//!
//! A file's bounds come from its storage unit (`storage_class[@hsm]`) when
//! the topology defines one, otherwise from the defaults of its pool group.
//! Scans work per group and use folded bounds that cover every unit linked
//! to the group.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::clients::NamespaceClient;
use crate::clients::with_timeout;
use crate::error::ResilienceError;
use crate::error::Result;
use crate::topology::PoolGroupConfig;
use crate::topology::PoolTopology;
use crate::topology::TopologyView;
use crate::types::AccessLatency;
use crate::types::FileId;
use crate::verified::fold_group_bounds;

/// Allowed replica-count range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplicationConstraints {
    /// Lower bound on durable replicas.
    pub minimum: u32,
    /// Upper bound on durable replicas.
    pub maximum: u32,
    /// Whether two replicas may live on pools of the same host.
    pub same_host_allowed: bool,
    /// Whether the file needs management at all.
    pub requires_replication: bool,
}

impl ReplicationConstraints {
    fn from_group(group: &PoolGroupConfig) -> Self {
        Self {
            minimum: group.minimum,
            maximum: group.maximum,
            same_host_allowed: group.same_host_allowed,
            requires_replication: group.minimum > 1,
        }
    }
}

/// Resolves constraints against the current topology.
pub struct ConstraintResolver {
    topology: Arc<TopologyView>,
    namespace: Arc<dyn NamespaceClient>,
    request_timeout: Duration,
}

impl ConstraintResolver {
    /// Create a resolver.
    pub fn new(topology: Arc<TopologyView>, namespace: Arc<dyn NamespaceClient>, request_timeout: Duration) -> Self {
        Self {
            topology,
            namespace,
            request_timeout,
        }
    }

    /// Bounds for one file in one group.
    ///
    /// Files that are not ONLINE are never managed. A storage unit overrides
    /// all three group defaults at once.
    pub async fn for_file(&self, file_id: &FileId, group: &str) -> Result<ReplicationConstraints> {
        let topology = self.topology.snapshot();
        let defaults = ReplicationConstraints::from_group(group_config(&topology, group)?);

        let attributes =
            with_timeout("file_attributes", self.request_timeout, self.namespace.file_attributes(file_id)).await?;

        if attributes.access_latency != AccessLatency::Online {
            debug!(file = %file_id, group, "file is not online, no replication required");
            return Ok(ReplicationConstraints {
                requires_replication: false,
                ..defaults
            });
        }

        let unit = attributes.storage_unit_key().and_then(|key| topology.storage_unit(&key).cloned());
        Ok(match unit {
            Some(unit) => ReplicationConstraints {
                minimum: unit.minimum,
                maximum: unit.maximum,
                same_host_allowed: unit.same_host_allowed,
                requires_replication: unit.minimum > 1,
            },
            None => defaults,
        })
    }

    /// Folded bounds for a whole group: the largest minimum and smallest
    /// maximum across the defaults and every linked unit.
    pub fn for_group(&self, group: &str) -> Result<ReplicationConstraints> {
        let topology = self.topology.snapshot();
        let config = group_config(&topology, group)?;
        let units = topology.units_linked_to(group).into_iter().map(|u| (u.minimum, u.maximum));
        let (minimum, maximum) = fold_group_bounds((config.minimum, config.maximum), units);
        Ok(ReplicationConstraints {
            minimum,
            maximum,
            same_host_allowed: config.same_host_allowed,
            requires_replication: config.is_resilient(),
        })
    }

    /// Check that every constraint applying to `group` can be met by its members.
    ///
    /// Fails with [`ResilienceError::Configuration`] when a minimum exceeds
    /// the member count, or the number of distinct hosts when replicas may
    /// not share a host.
    pub fn verify_group(&self, group: &str) -> Result<()> {
        let topology = self.topology.snapshot();
        let config = group_config(&topology, group)?;
        let members = config.pools.len();
        let hosts: BTreeSet<&str> = config.pools.iter().filter_map(|p| topology.host_of(p)).collect();

        let mut checks = vec![(format!("group {group}"), config.minimum, config.same_host_allowed)];
        checks.extend(
            topology
                .units_linked_to(group)
                .into_iter()
                .map(|u| (format!("storage unit {}", u.name), u.minimum, u.same_host_allowed)),
        );

        let mut problems = Vec::new();
        for (name, minimum, same_host_allowed) in checks {
            let minimum = minimum as usize;
            if minimum > members {
                problems.push(format!("{name}: minimum {minimum} exceeds {members} member pools"));
            } else if !same_host_allowed && minimum > hosts.len() {
                problems.push(format!("{name}: minimum {minimum} exceeds {} distinct hosts", hosts.len()));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ResilienceError::Configuration {
                message: problems.join("; "),
            })
        }
    }
}

fn group_config<'a>(topology: &'a PoolTopology, group: &str) -> Result<&'a PoolGroupConfig> {
    topology.group(group).ok_or_else(|| ResilienceError::not_found("pool group", group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryNamespace;
    use crate::testing::sample_topology;
    use crate::types::FileAttributes;

    fn resolver(namespace: Arc<InMemoryNamespace>) -> ConstraintResolver {
        ConstraintResolver::new(Arc::new(TopologyView::new(sample_topology())), namespace, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_group_defaults_without_unit() {
        let namespace = Arc::new(InMemoryNamespace::default());
        namespace.add_file(FileAttributes::online(FileId::new("f1")), ["p1"]);
        let constraints = resolver(namespace).for_file(&FileId::new("f1"), "resilient").await.unwrap();
        assert_eq!((constraints.minimum, constraints.maximum), (2, 3));
        assert!(constraints.requires_replication);
    }

    #[tokio::test]
    async fn test_storage_unit_overrides() {
        let namespace = Arc::new(InMemoryNamespace::default());
        let mut attributes = FileAttributes::online(FileId::new("f1"));
        attributes.storage_class = Some("exp:raw".into());
        attributes.hsm = Some("osm".into());
        namespace.add_file(attributes, ["p1"]);

        let constraints = resolver(namespace).for_file(&FileId::new("f1"), "resilient").await.unwrap();
        assert_eq!((constraints.minimum, constraints.maximum), (3, 3));
        assert!(constraints.same_host_allowed);
    }

    #[tokio::test]
    async fn test_nearline_needs_no_replication() {
        let namespace = Arc::new(InMemoryNamespace::default());
        let mut attributes = FileAttributes::online(FileId::new("f1"));
        attributes.access_latency = AccessLatency::Nearline;
        namespace.add_file(attributes, ["p1"]);

        let constraints = resolver(namespace).for_file(&FileId::new("f1"), "resilient").await.unwrap();
        assert!(!constraints.requires_replication);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let namespace = Arc::new(InMemoryNamespace::default());
        let err = resolver(namespace).for_file(&FileId::new("gone"), "resilient").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_for_group_folds_linked_units() {
        let resolver = resolver(Arc::new(InMemoryNamespace::default()));
        let constraints = resolver.for_group("resilient").unwrap();
        assert_eq!((constraints.minimum, constraints.maximum), (3, 3));
        assert!(resolver.for_group("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_verify_group_reports_unsatisfiable_minimum() {
        let resolver = resolver(Arc::new(InMemoryNamespace::default()));
        // Four members on three hosts.
        resolver.verify_group("resilient").unwrap();

        let mut config = sample_topology().to_config();
        config.groups.iter_mut().filter(|g| g.name == "resilient").for_each(|g| {
            g.minimum = 4;
            g.maximum = 4;
        });
        resolver.topology.reload(PoolTopology::from_config(config).unwrap());

        let err = resolver.verify_group("resilient").unwrap_err();
        assert!(matches!(err, ResilienceError::Configuration { ref message } if message.contains("distinct hosts")));
    }
}
