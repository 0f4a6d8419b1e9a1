//! The composition root: registries, collaborators, and the map of managed
//! clusters.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::action::audit::ActionAuditor;
use crate::action::engine::ActionEngine;
use crate::automation::AutomationEngine;
use crate::cluster::Cluster;
use crate::config::{AutomationConfig, ClusterConfig};
use crate::error::{Result, TillerError};
use crate::metrics::Metrics;
use crate::plugin::Registries;
use crate::snapshot::ClusterStateSink;

// ---------------------------------------------------------------------------
// ManagedCluster
// ---------------------------------------------------------------------------

/// One cluster bundled with its engines. The bundle owns the strong
/// references; the cluster itself only links back weakly.
pub struct ManagedCluster {
    cluster: Arc<Cluster>,
    engine: Arc<ActionEngine>,
    automation: Arc<AutomationEngine>,
}

impl ManagedCluster {
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn engine(&self) -> &Arc<ActionEngine> {
        &self.engine
    }

    pub fn automation(&self) -> &Arc<AutomationEngine> {
        &self.automation
    }

    fn start(&self) {
        self.engine.start();
        self.automation.start();
    }

    fn stop(&self) {
        self.automation.stop();
        self.engine.stop();
    }
}

// ---------------------------------------------------------------------------
// ClusterManager
// ---------------------------------------------------------------------------

pub struct ClusterManager {
    registries: Arc<Registries>,
    auditor: Option<Arc<dyn ActionAuditor>>,
    state_sink: Option<Arc<dyn ClusterStateSink>>,
    automation: AutomationConfig,
    metrics: Arc<Metrics>,
    clusters: RwLock<BTreeMap<String, Arc<ManagedCluster>>>,
}

impl ClusterManager {
    pub fn new(
        registries: Arc<Registries>,
        auditor: Option<Arc<dyn ActionAuditor>>,
        state_sink: Option<Arc<dyn ClusterStateSink>>,
        automation: AutomationConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        ClusterManager {
            registries,
            auditor,
            state_sink,
            automation,
            metrics,
            clusters: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build a cluster from configuration: seed nodes, restore the
    /// checkpoint if one exists, instantiate the enabled sensors and
    /// operators, and assemble the engines. The bundle is registered but
    /// not started.
    pub fn add_cluster(&self, config: &ClusterConfig) -> Result<Arc<ManagedCluster>> {
        if self.clusters.read().unwrap().contains_key(&config.id) {
            return Err(TillerError::ClusterExists(config.id.clone()));
        }

        let cluster = Cluster::new(&config.id, &config.name, &config.kind);
        for node in &config.nodes {
            cluster.upsert_node(node.clone());
        }

        if let Some(sink) = &self.state_sink {
            match sink.deserialize(&config.id) {
                Ok(Some(snapshot)) => {
                    snapshot.restore_nodes(&cluster);
                    info!(cluster = config.id, "restored checkpointed state");
                }
                Ok(None) => {
                    warn!(
                        cluster = config.id,
                        "no past state for the cluster, skipping state restoration"
                    );
                }
                Err(e) => warn!(cluster = config.id, error = %e, "failed to restore state"),
            }
        }

        let engine = ActionEngine::new(
            cluster.clone(),
            self.registries.clone(),
            self.auditor.clone(),
            self.metrics.clone(),
        );

        let mut sensors = Vec::new();
        for spec in self.registries.sensors.enabled_specs(&config.id) {
            sensors.push((
                spec.key.clone(),
                self.registries.sensors.build(&config.id, &spec.key)?,
            ));
        }
        let mut operators = Vec::new();
        for spec in self.registries.operators.enabled_specs(&config.id) {
            operators.push((
                spec.key.clone(),
                self.registries.operators.build(&config.id, &spec.key)?,
            ));
        }

        let automation = AutomationEngine::new(
            cluster.clone(),
            engine.clone(),
            sensors,
            operators,
            Duration::from_secs(self.automation.operator_interval_secs),
            self.metrics.clone(),
        );
        cluster.link_engines(&engine, &automation);

        let managed = Arc::new(ManagedCluster {
            cluster,
            engine,
            automation,
        });
        self.clusters
            .write()
            .unwrap()
            .insert(config.id.clone(), managed.clone());
        Ok(managed)
    }

    /// Start every registered cluster's engines.
    pub fn start(&self) {
        for managed in self.clusters() {
            managed.start();
            info!(cluster = managed.cluster().id(), "cluster started");
        }
    }

    pub fn shutdown(&self) {
        for managed in self.clusters() {
            managed.stop();
        }
    }

    pub fn get(&self, cluster_id: &str) -> Option<Arc<ManagedCluster>> {
        self.clusters.read().unwrap().get(cluster_id).cloned()
    }

    pub fn clusters(&self) -> Vec<Arc<ManagedCluster>> {
        self.clusters.read().unwrap().values().cloned().collect()
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        self.clusters.read().unwrap().keys().cloned().collect()
    }

    /// Replay the auditor's recent window into the tracked-action maps.
    /// Best-effort: a failing auditor leaves the maps empty.
    pub async fn load_audited_actions(&self) {
        let Some(auditor) = &self.auditor else {
            return;
        };
        if let Err(e) = auditor.load_actions(self).await {
            warn!(error = %e, "failed to load audited actions");
        }
    }

    /// Checkpoint every cluster through the state sink, best-effort.
    pub fn checkpoint_all(&self) {
        let Some(sink) = &self.state_sink else {
            return;
        };
        for managed in self.clusters() {
            if let Err(e) = sink.serialize(managed.cluster()) {
                warn!(cluster = managed.cluster().id(), error = %e, "checkpoint failed");
            }
        }
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
