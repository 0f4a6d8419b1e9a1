//! Process configuration (`tiller.yaml`).
//!
//! One file describes the managed clusters, the global plugin catalog,
//! per-cluster plugin overrides, and the collaborator settings (audit store,
//! checkpoint directory).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, TillerError};
use crate::node::NodeInfo;
use crate::plugin::PluginSpec;

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TillerConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Global plugin catalog.
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub id: String,
    pub name: String,
    /// Managed system family, e.g. `kafka`, `hbase`, `clickhouse`.
    pub kind: String,
    /// Seed nodes known ahead of agent registration.
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
    /// Per-cluster plugin overrides, merged over the global catalog.
    #[serde(default)]
    pub plugins: Option<PluginsConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PluginsConfig {
    #[serde(default)]
    pub sensors: Vec<PluginSpec>,
    #[serde(default)]
    pub operators: Vec<PluginSpec>,
    #[serde(default)]
    pub actions: Vec<PluginSpec>,
    #[serde(default)]
    pub alerts: Vec<PluginSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutomationConfig {
    /// Operator evaluation cadence when the plan is idle.
    #[serde(default = "default_operator_interval_secs")]
    pub operator_interval_secs: u64,
}

fn default_operator_interval_secs() -> u64 {
    30
}

impl Default for AutomationConfig {
    fn default() -> Self {
        AutomationConfig {
            operator_interval_secs: default_operator_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Path of the audit store database file.
    pub path: PathBuf,
    /// How far back to replay completed actions on startup.
    #[serde(default = "default_backfill_secs")]
    pub backfill_secs: u64,
}

fn default_backfill_secs() -> u64 {
    86_400
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Directory holding one snapshot file per cluster.
    pub dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl TillerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: TillerConfig = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: TillerConfig = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if !seen.insert(cluster.id.as_str()) {
                return Err(TillerError::ClusterExists(cluster.id.clone()));
            }
            let mut node_ids = HashSet::new();
            for node in &cluster.nodes {
                if !node_ids.insert(node.node_id.as_str()) {
                    return Err(TillerError::InvalidConfig {
                        key: format!("clusters.{}.nodes", cluster.id),
                        reason: format!("duplicate node id {}", node.node_id),
                    });
                }
            }
        }
        if self.automation.operator_interval_secs == 0 {
            return Err(TillerError::InvalidConfig {
                key: "automation.operator_interval_secs".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
clusters:
  - id: kafka-test-1
    name: Kafka Test
    kind: kafka
    nodes:
      - node_id: n1
        hostname: n1.example.test
        service_port: 9092
    plugins:
      operators:
        - key: stale-node
          enabled: false
plugins:
  sensors:
    - key: node-heartbeat
      plugin: heartbeat
      enabled: true
      configuration:
        interval_secs: 15
  operators:
    - key: stale-node
      plugin: stale-node
      enabled: true
  actions:
    - key: restart-service
      plugin: restart-service
      enabled: true
  alerts:
    - key: ops-log
      plugin: log
      enabled: true
      levels: [medium, high]
automation:
  operator_interval_secs: 10
audit:
  path: /var/lib/tiller/audit.redb
"#;

    #[test]
    fn parses_full_sample() {
        let cfg = TillerConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.clusters.len(), 1);
        assert_eq!(cfg.clusters[0].kind, "kafka");
        assert_eq!(cfg.clusters[0].nodes[0].service_port, Some(9092));
        assert_eq!(cfg.plugins.sensors[0].key, "node-heartbeat");
        assert_eq!(cfg.automation.operator_interval_secs, 10);
        let audit = cfg.audit.unwrap();
        assert_eq!(audit.backfill_secs, 86_400);
        assert!(cfg.checkpoint.is_none());

        let overrides = cfg.clusters[0].plugins.as_ref().unwrap();
        assert_eq!(overrides.operators[0].key, "stale-node");
        assert!(!overrides.operators[0].enabled);
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let cfg = TillerConfig::from_yaml("{}").unwrap();
        assert!(cfg.clusters.is_empty());
        assert_eq!(cfg.automation.operator_interval_secs, 30);
    }

    #[test]
    fn duplicate_cluster_ids_are_rejected() {
        let yaml = r#"
clusters:
  - { id: c1, name: A, kind: kafka }
  - { id: c1, name: B, kind: kafka }
"#;
        assert!(matches!(
            TillerConfig::from_yaml(yaml),
            Err(TillerError::ClusterExists(_))
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let yaml = "automation:\n  operator_interval_secs: 0\n";
        assert!(matches!(
            TillerConfig::from_yaml(yaml),
            Err(TillerError::InvalidConfig { .. })
        ));
    }
}
