//! File-backed checkpoint sink: one versioned JSON snapshot per cluster,
//! written atomically.

use std::path::{Path, PathBuf};

use tracing::info;

use tiller_core::cluster::Cluster;
use tiller_core::error::{Result, TillerError};
use tiller_core::io::atomic_write;
use tiller_core::snapshot::{ClusterSnapshot, ClusterStateSink, SNAPSHOT_VERSION};

pub struct FileClusterStateSink {
    dir: PathBuf,
}

impl FileClusterStateSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileClusterStateSink { dir: dir.into() }
    }

    fn path_for(&self, cluster_id: &str) -> PathBuf {
        self.dir.join(format!("{cluster_id}.json"))
    }
}

impl ClusterStateSink for FileClusterStateSink {
    fn name(&self) -> String {
        "file-cluster-state-sink".into()
    }

    fn serialize(&self, cluster: &Cluster) -> Result<()> {
        let snapshot = ClusterSnapshot::capture(cluster);
        let data = serde_json::to_vec_pretty(&snapshot)?;
        atomic_write(&self.path_for(cluster.id()), &data)?;
        info!(cluster = cluster.id(), "checkpointed cluster state");
        Ok(())
    }

    fn deserialize(&self, cluster_id: &str) -> Result<Option<ClusterSnapshot>> {
        let path = self.path_for(cluster_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        let snapshot: ClusterSnapshot = serde_json::from_str(&data)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(TillerError::Checkpoint(format!(
                "snapshot {} has version {} newer than supported {}",
                path_display(&path),
                snapshot.version,
                SNAPSHOT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }
}

fn path_display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use tiller_core::node::NodeInfo;

    fn cluster_with_node() -> std::sync::Arc<Cluster> {
        let cluster = Cluster::new("c1", "C1", "kafka");
        cluster.upsert_node(NodeInfo {
            node_id: "n1".into(),
            hostname: "n1.example.test".into(),
            ip: None,
            service_port: Some(9092),
            rack: None,
            reported_at: Utc::now(),
        });
        cluster
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let sink = FileClusterStateSink::new(dir.path());
        sink.serialize(&cluster_with_node()).unwrap();

        let snapshot = sink.deserialize("c1").unwrap().unwrap();
        assert_eq!(snapshot.cluster_id, "c1");
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].info.node_id, "n1");
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = TempDir::new().unwrap();
        let sink = FileClusterStateSink::new(dir.path());
        assert!(sink.deserialize("nope").unwrap().is_none());
    }

    #[test]
    fn newer_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = FileClusterStateSink::new(dir.path());
        sink.serialize(&cluster_with_node()).unwrap();

        // Bump the version on disk past what this build supports.
        let path = dir.path().join("c1.json");
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        value["version"] = serde_json::json!(SNAPSHOT_VERSION + 1);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(matches!(
            sink.deserialize("c1"),
            Err(TillerError::Checkpoint(_))
        ));
    }
}
