//! Assemble a running control plane from configuration.

use std::sync::Arc;

use tiller_core::action::audit::ActionAuditor;
use tiller_core::config::TillerConfig;
use tiller_core::error::Result;
use tiller_core::manager::ClusterManager;
use tiller_core::metrics::Metrics;
use tiller_core::plugin::Registries;
use tiller_core::snapshot::ClusterStateSink;

use crate::audit_db::RedbActionAuditor;
use crate::demo::register_builtin_plugins;
use crate::state_file::FileClusterStateSink;

/// Build the cluster manager: register built-in plugins, layer the
/// configured plugin catalog over them, open the collaborators, and
/// construct every configured cluster. Nothing is started yet.
pub fn build_manager(config: &TillerConfig) -> Result<ClusterManager> {
    let mut registries = Registries::new();
    register_builtin_plugins(&mut registries);
    registries.apply_global(&config.plugins)?;
    for cluster in &config.clusters {
        if let Some(overrides) = &cluster.plugins {
            registries.apply_cluster_overrides(&cluster.id, overrides)?;
        }
    }

    let auditor: Option<Arc<dyn ActionAuditor>> = match &config.audit {
        Some(audit) => Some(Arc::new(RedbActionAuditor::open(
            &audit.path,
            audit.backfill_secs,
        )?)),
        None => None,
    };
    let state_sink: Option<Arc<dyn ClusterStateSink>> = config
        .checkpoint
        .as_ref()
        .map(|c| Arc::new(FileClusterStateSink::new(c.dir.clone())) as Arc<dyn ClusterStateSink>);

    let manager = ClusterManager::new(
        Arc::new(registries),
        auditor,
        state_sink,
        config.automation.clone(),
        Metrics::new(),
    );
    for cluster in &config.clusters {
        manager.add_cluster(cluster)?;
    }
    Ok(manager)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tiller_core::error::TillerError;

    #[test]
    fn builds_clusters_and_collaborators_from_yaml() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            r#"
clusters:
  - id: kafka-demo
    name: Kafka Demo
    kind: kafka
    nodes:
      - node_id: n1
        hostname: n1.example.test
plugins:
  sensors:
    - key: node-heartbeat
      plugin: demo-heartbeat
      enabled: true
audit:
  path: {audit}
checkpoint:
  dir: {checkpoint}
"#,
            audit = dir.path().join("audit.redb").display(),
            checkpoint = dir.path().join("checkpoints").display(),
        );
        let config = TillerConfig::from_yaml(&yaml).unwrap();
        let manager = build_manager(&config).unwrap();

        let managed = manager.get("kafka-demo").unwrap();
        assert_eq!(managed.cluster().node_count(), 1);
        assert_eq!(managed.automation().sensors().len(), 1);
        assert!(dir.path().join("audit.redb").exists());
    }

    #[test]
    fn unknown_plugin_name_fails_the_bootstrap() {
        let yaml = r#"
plugins:
  sensors:
    - key: bad
      plugin: not-a-real-sensor
      enabled: true
"#;
        let config = TillerConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            build_manager(&config),
            Err(TillerError::UnknownPlugin { .. })
        ));
    }

    #[test]
    fn cluster_override_without_base_fails_the_bootstrap() {
        let yaml = r#"
clusters:
  - id: c1
    name: C1
    kind: kafka
    plugins:
      sensors:
        - key: never-declared
          enabled: true
"#;
        let config = TillerConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            build_manager(&config),
            Err(TillerError::MissingBaseConfig { .. })
        ));
    }
}
