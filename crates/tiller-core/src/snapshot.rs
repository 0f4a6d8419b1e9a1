//! Restart checkpointing: a versioned, explicit-schema snapshot of the
//! fields worth carrying across a process restart. Not invoked on any hot
//! path.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::Cluster;
use crate::error::Result;
use crate::node::{NodeInfo, NodeStatus};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub info: NodeInfo,
    pub status: NodeStatus,
}

/// Everything a restarted process restores, spelled out field by field so
/// the format survives structural changes to the in-memory types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub cluster_id: String,
    pub name: String,
    pub kind: String,
    pub nodes: Vec<NodeSnapshot>,
    /// Visible attribute values at capture time, kept for operability.
    /// Restore does not replay them; sensors repopulate the store.
    pub attributes: BTreeMap<String, Value>,
    pub taken_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl ClusterSnapshot {
    pub fn capture(cluster: &Cluster) -> Self {
        ClusterSnapshot {
            version: SNAPSHOT_VERSION,
            cluster_id: cluster.id().to_string(),
            name: cluster.name().to_string(),
            kind: cluster.kind().to_string(),
            nodes: cluster
                .nodes()
                .iter()
                .map(|n| NodeSnapshot {
                    info: n.info(),
                    status: n.status(),
                })
                .collect(),
            attributes: cluster
                .attrs()
                .visible()
                .into_iter()
                .map(|(k, a)| (k, a.value))
                .collect(),
            taken_at: Utc::now(),
        }
    }

    /// Re-register the snapshotted nodes on a freshly built cluster.
    pub fn restore_nodes(&self, cluster: &Cluster) {
        for snap in &self.nodes {
            let node = cluster.upsert_node(snap.info.clone());
            node.set_status(snap.status);
        }
    }
}

/// Collaborator boundary for checkpoint storage.
pub trait ClusterStateSink: Send + Sync {
    fn name(&self) -> String;

    fn serialize(&self, cluster: &Cluster) -> Result<()>;

    fn deserialize(&self, cluster_id: &str) -> Result<Option<ClusterSnapshot>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(id: &str) -> NodeInfo {
        NodeInfo {
            node_id: id.into(),
            hostname: format!("{id}.example.test"),
            ip: None,
            service_port: Some(9092),
            rack: Some("us-east-1a".into()),
            reported_at: Utc::now(),
        }
    }

    #[test]
    fn capture_and_restore_nodes() {
        let cluster = Cluster::new("c1", "C1", "kafka");
        cluster.upsert_node(info("n1"));
        let node = cluster.upsert_node(info("n2"));
        node.set_status(NodeStatus::Maintenance);
        cluster.attrs().set("broker.count", json!(2), "topology");
        cluster.attrs().set_hidden("internal", json!("x"), "topology");

        let snapshot = ClusterSnapshot::capture(&cluster);
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.attributes.get("broker.count"), Some(&json!(2)));
        // Hidden attributes stay out of the checkpoint.
        assert!(!snapshot.attributes.contains_key("internal"));

        let restored = Cluster::new("c1", "C1", "kafka");
        snapshot.restore_nodes(&restored);
        assert_eq!(restored.node_count(), 2);
        assert_eq!(
            restored.node("n2").unwrap().status(),
            NodeStatus::Maintenance
        );
    }

    #[test]
    fn snapshot_json_defaults_version() {
        let cluster = Cluster::new("c1", "C1", "kafka");
        let mut value = serde_json::to_value(ClusterSnapshot::capture(&cluster)).unwrap();
        value.as_object_mut().unwrap().remove("version");
        let parsed: ClusterSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.version, SNAPSHOT_VERSION);
    }
}
