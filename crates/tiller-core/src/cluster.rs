//! In-memory representation of one managed cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use crate::action::engine::ActionEngine;
use crate::attrs::AttributeBag;
use crate::automation::AutomationEngine;
use crate::node::{Node, NodeInfo};

/// Cluster identity and live state. Engines are linked weakly once the
/// managed bundle is assembled; the manager holds the strong references, so
/// the cluster/engine graph stays cycle-free.
pub struct Cluster {
    id: String,
    name: String,
    kind: String,
    nodes: RwLock<BTreeMap<String, Arc<Node>>>,
    attrs: AttributeBag,
    maintenance: AtomicBool,
    action_engine: OnceLock<Weak<ActionEngine>>,
    automation: OnceLock<Weak<AutomationEngine>>,
}

impl Cluster {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Cluster {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            nodes: RwLock::new(BTreeMap::new()),
            attrs: AttributeBag::new(),
            maintenance: AtomicBool::new(false),
            action_engine: OnceLock::new(),
            automation: OnceLock::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn attrs(&self) -> &AttributeBag {
        &self.attrs
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    pub fn node(&self, node_id: &str) -> Option<Arc<Node>> {
        self.nodes.read().unwrap().get(node_id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    /// Register a node, or refresh its info snapshot if already known.
    pub fn upsert_node(&self, info: NodeInfo) -> Arc<Node> {
        let mut nodes = self.nodes.write().unwrap();
        match nodes.get(&info.node_id) {
            Some(node) => {
                node.set_info(info);
                node.clone()
            }
            None => {
                let node = Arc::new(Node::new(info.clone()));
                nodes.insert(info.node_id, node.clone());
                node
            }
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance mode
    // -----------------------------------------------------------------------

    /// While set, the operator executor skips evaluation entirely.
    pub fn is_under_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Engine links
    // -----------------------------------------------------------------------

    pub(crate) fn link_engines(
        &self,
        engine: &Arc<ActionEngine>,
        automation: &Arc<AutomationEngine>,
    ) {
        let _ = self.action_engine.set(Arc::downgrade(engine));
        let _ = self.automation.set(Arc::downgrade(automation));
    }

    pub fn action_engine(&self) -> Option<Arc<ActionEngine>> {
        self.action_engine.get().and_then(Weak::upgrade)
    }

    pub fn automation(&self) -> Option<Arc<AutomationEngine>> {
        self.automation.get().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("nodes", &self.node_count())
            .field("maintenance", &self.is_under_maintenance())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn info(id: &str) -> NodeInfo {
        NodeInfo {
            node_id: id.into(),
            hostname: format!("{id}.example.test"),
            ip: None,
            service_port: None,
            rack: None,
            reported_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_registers_then_refreshes() {
        let cluster = Cluster::new("kafka-test-1", "Kafka Test", "kafka");
        let n1 = cluster.upsert_node(info("n1"));
        assert_eq!(cluster.node_count(), 1);

        let mut updated = info("n1");
        updated.hostname = "n1.rack2.example.test".into();
        let again = cluster.upsert_node(updated);
        assert!(Arc::ptr_eq(&n1, &again));
        assert_eq!(cluster.node_count(), 1);
        assert_eq!(n1.info().hostname, "n1.rack2.example.test");
    }

    #[test]
    fn maintenance_flag_toggles() {
        let cluster = Cluster::new("c1", "C1", "hbase");
        assert!(!cluster.is_under_maintenance());
        cluster.set_maintenance(true);
        assert!(cluster.is_under_maintenance());
        cluster.set_maintenance(false);
        assert!(!cluster.is_under_maintenance());
    }

    #[test]
    fn engines_are_absent_until_linked() {
        let cluster = Cluster::new("c1", "C1", "clickhouse");
        assert!(cluster.action_engine().is_none());
        assert!(cluster.automation().is_none());
    }
}
