//! The audit collaborator boundary: durable history of completed root
//! actions, replayable on restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::CmdResult;
use crate::error::{Result, TillerError};
use crate::manager::ClusterManager;

use super::{ActionCx, ActionStatus, ActionTask, ActionType};

// ---------------------------------------------------------------------------
// ActionRecord
// ---------------------------------------------------------------------------

/// Denormalized snapshot of an action, the unit the auditor persists and the
/// shape the admin surface consumes. Times are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub uuid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub create_time: i64,
    pub complete_time: Option<i64>,
    pub owner: Option<String>,
    #[serde(default)]
    pub children: Vec<ActionRecord>,
    pub result: CmdResult,
}

// ---------------------------------------------------------------------------
// ActionAuditor
// ---------------------------------------------------------------------------

/// Durable action history. Write failures are best-effort for callers: the
/// engine logs them and moves on.
#[async_trait]
pub trait ActionAuditor: Send + Sync {
    fn name(&self) -> String;

    /// Persist one completed root action, keyed by cluster id.
    async fn log_action(&self, cluster_id: &str, record: &ActionRecord) -> Result<()>;

    /// Replay a bounded recent window of records back into each known
    /// cluster's tracked-action map.
    async fn load_actions(&self, manager: &ClusterManager) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HistoricTask
// ---------------------------------------------------------------------------

/// Placeholder task for replayed actions. Carries the recorded name and
/// type; it refuses to execute.
pub(crate) struct HistoricTask {
    pub name: String,
    pub action_type: ActionType,
}

#[async_trait]
impl ActionTask for HistoricTask {
    fn kind(&self) -> &str {
        "historic"
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn action_type(&self) -> ActionType {
        self.action_type
    }

    async fn execute(&self, _cx: &ActionCx) -> Result<()> {
        Err(TillerError::Plugin(
            "historic actions cannot be re-run".into(),
        ))
    }
}
