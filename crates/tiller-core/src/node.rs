//! Node model: one managed host/process of a cluster.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::NodeCmd;
use crate::error::{Result, TillerError};

// ---------------------------------------------------------------------------
// NodeInfo / NodeStatus
// ---------------------------------------------------------------------------

/// Snapshot of a node's identity and placement, as last reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub hostname: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub service_port: Option<u16>,
    #[serde(default)]
    pub rack: Option<String>,
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Commissioned,
    Maintenance,
    Decommissioned,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A managed host. Sensors refresh the info snapshot; actions hand commands
/// to the node through a single-slot mailbox (one pending command at a time,
/// matching the agent protocol).
#[derive(Debug)]
pub struct Node {
    info: Mutex<NodeInfo>,
    status: Mutex<NodeStatus>,
    cmd_slot: Mutex<Option<NodeCmd>>,
}

impl Node {
    pub fn new(info: NodeInfo) -> Self {
        Node {
            info: Mutex::new(info),
            status: Mutex::new(NodeStatus::Commissioned),
            cmd_slot: Mutex::new(None),
        }
    }

    pub fn id(&self) -> String {
        self.info.lock().unwrap().node_id.clone()
    }

    pub fn info(&self) -> NodeInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn set_info(&self, info: NodeInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: NodeStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Hand a command to this node. Fails if one is already pending; the
    /// caller decides whether to wait or give up.
    pub fn submit_command(&self, cmd: NodeCmd) -> Result<NodeCmd> {
        let mut slot = self.cmd_slot.lock().unwrap();
        let occupied = slot.as_ref().is_some_and(|pending| !pending.is_settled());
        if occupied {
            return Err(TillerError::CommandPending(self.id()));
        }
        *slot = Some(cmd.clone());
        Ok(cmd)
    }

    /// The command currently occupying the mailbox, settled or not.
    pub fn current_command(&self) -> Option<NodeCmd> {
        self.cmd_slot.lock().unwrap().clone()
    }

    /// Drop the pending command, cancelling it if it has not settled.
    pub fn clear_command(&self) {
        let mut slot = self.cmd_slot.lock().unwrap();
        if let Some(cmd) = slot.take() {
            if !cmd.is_settled() {
                cmd.mark_cancelled();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
