//! Built-in demo plugins: a heartbeat sensor, a stale-node operator, a
//! restart action, and a log-based alert transport. Together they exercise
//! the whole observe → decide → act loop against a cluster with no real
//! agents, and double as the reference for writing system-specific plugins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use tiller_core::action::{Action, ActionCx, ActionTask, ActionType};
use tiller_core::alert::{Alert, AlertMessage};
use tiller_core::command::{NodeCmd, RESTART_SERVICE_CMD};
use tiller_core::error::{Result, TillerError};
use tiller_core::operator::{Operator, OperatorCx};
use tiller_core::plugin::{PluginSettings, Registries};
use tiller_core::sensor::{Sensor, SensorCx};

/// Attribute key listing the node ids whose last report is overdue.
pub const STALE_NODES_ATTR: &str = "nodes.stale";

/// Attribute key holding the total node count.
pub const TOTAL_NODES_ATTR: &str = "nodes.total";

fn settings_u64(settings: &PluginSettings, key: &str) -> Option<u64> {
    settings.get(key).and_then(|v| v.as_u64())
}

// ---------------------------------------------------------------------------
// HeartbeatSensor
// ---------------------------------------------------------------------------

/// Publishes the node count and the set of nodes whose info snapshot has not
/// been refreshed within `stale_after`.
pub struct HeartbeatSensor {
    interval: Duration,
    stale_after: chrono::Duration,
}

impl HeartbeatSensor {
    pub fn from_settings(settings: &PluginSettings) -> Result<Self> {
        Ok(HeartbeatSensor {
            interval: Duration::from_secs(settings_u64(settings, "interval_secs").unwrap_or(30)),
            stale_after: chrono::Duration::seconds(
                settings_u64(settings, "stale_after_secs").unwrap_or(90) as i64,
            ),
        })
    }
}

#[async_trait]
impl Sensor for HeartbeatSensor {
    fn name(&self) -> String {
        "heartbeat".into()
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn observe(&self, cx: &SensorCx<'_>) -> Result<()> {
        let cutoff = chrono::Utc::now() - self.stale_after;
        let nodes = cx.cluster().nodes();
        let mut stale: Vec<String> = nodes
            .iter()
            .filter(|n| n.info().reported_at < cutoff)
            .map(|n| n.id())
            .collect();
        stale.sort();
        cx.publish(TOTAL_NODES_ATTR, json!(nodes.len()));
        cx.publish(STALE_NODES_ATTR, json!(stale));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaleNodeOperator
// ---------------------------------------------------------------------------

/// Proposes one service restart per stale node, in node-id order so the
/// proposal is stable across cycles.
pub struct StaleNodeOperator;

#[async_trait]
impl Operator for StaleNodeOperator {
    fn name(&self) -> String {
        "stale-node".into()
    }

    async fn operate(&self, cx: &mut OperatorCx<'_>) -> Result<()> {
        let stale: Vec<String> = match cx.cluster().attrs().get(STALE_NODES_ATTR) {
            Some(attr) => attr.value_as()?,
            None => {
                cx.set_message("no heartbeat data yet");
                return Ok(());
            }
        };
        for node_id in &stale {
            cx.dispatch(Action::new(Box::new(RestartServiceTask::for_node(node_id))));
        }
        cx.set_message(format!("{} stale node(s)", stale.len()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RestartServiceTask
// ---------------------------------------------------------------------------

/// Issues a `restartService` command to one node. With no real agent
/// attached, the demo completes the command itself after an optional
/// configured pause.
#[derive(Debug)]
pub struct RestartServiceTask {
    node_id: String,
    pause_ms: AtomicU64,
}

impl RestartServiceTask {
    pub fn for_node(node_id: impl Into<String>) -> Self {
        RestartServiceTask {
            node_id: node_id.into(),
            pause_ms: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &PluginSettings) -> Result<Self> {
        let node_id = settings
            .get("node_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TillerError::MissingConfig("node_id".into()))?;
        let task = RestartServiceTask::for_node(node_id);
        task.configure(settings)?;
        Ok(task)
    }
}

#[async_trait]
impl ActionTask for RestartServiceTask {
    fn kind(&self) -> &str {
        "demo-restart-service"
    }

    fn name(&self) -> String {
        format!("restart-service/{}", self.node_id)
    }

    fn action_type(&self) -> ActionType {
        ActionType::Node
    }

    fn configure(&self, settings: &PluginSettings) -> Result<()> {
        if let Some(pause) = settings_u64(settings, "pause_ms") {
            self.pause_ms.store(pause, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn execute(&self, cx: &ActionCx) -> Result<()> {
        // Tracked read: completing this action re-runs the heartbeat sensor
        // so the stale set reflects the restart.
        let _ = cx.cluster_attribute(STALE_NODES_ATTR);

        let node = cx
            .cluster()
            .node(&self.node_id)
            .ok_or_else(|| TillerError::NodeNotFound(self.node_id.clone()))?;
        let cmd = node.submit_command(NodeCmd::new(
            cx.action().id().to_string(),
            RESTART_SERVICE_CMD,
        ))?;
        cx.append_out(&format!("restart issued on node {}", self.node_id));

        let pause = self.pause_ms.load(Ordering::Relaxed);
        if pause > 0 {
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
        // Demo stand-in for the agent heartbeat reporting completion.
        cmd.complete(0, "service restarted", "");

        let result = cmd.wait(Duration::from_secs(30)).await?;
        match result.exit_code {
            Some(0) => {
                cx.append_out(&format!("node {} restarted", self.node_id));
                cx.mark_succeeded();
                Ok(())
            }
            code => Err(TillerError::Plugin(format!(
                "restart on {} exited with {code:?}",
                self.node_id
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// LogAlert
// ---------------------------------------------------------------------------

/// Delivery transport that writes alerts to the process log. Stands in for
/// chat/pager transports, which live outside the control plane.
pub struct LogAlert;

#[async_trait]
impl Alert for LogAlert {
    fn name(&self) -> String {
        "log".into()
    }

    async fn send(&self, message: &AlertMessage) -> Result<()> {
        warn!(
            entity = message.entity,
            owner = message.owner,
            title = message.title,
            body = message.body,
            link = message.link.as_deref().unwrap_or(""),
            "alert"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register the built-in plugins under their implementation names.
pub fn register_builtin_plugins(registries: &mut Registries) {
    registries
        .sensors
        .register("demo-heartbeat", |settings| {
            Ok(Box::new(HeartbeatSensor::from_settings(settings)?))
        });
    registries
        .operators
        .register("demo-stale-node", |_| Ok(Box::new(StaleNodeOperator)));
    registries
        .actions
        .register("demo-restart-service", |settings| {
            Ok(Box::new(RestartServiceTask::from_settings(settings)?))
        });
    registries.alerts.register("log", |_| Ok(Box::new(LogAlert)));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
