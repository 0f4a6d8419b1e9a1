//! Command results and the per-node command handle.
//!
//! `CmdResult` is the accumulated outcome of one unit of executed work: an
//! action's lifecycle payload, or the completion record an agent reports for
//! a node command. `NodeCmd` is the control-plane handle for a command handed
//! to a node's agent: the agent fills the shared result, the issuing action
//! polls it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TillerError};

pub const RESTART_SERVICE_CMD: &str = "restartService";
pub const START_SERVICE_CMD: &str = "startService";
pub const STOP_SERVICE_CMD: &str = "stopService";
pub const UPDATE_CONFIGS_CMD: &str = "updateConfigs";

/// Granularity of the polling wait in [`NodeCmd::wait`].
const POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// CmdResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdState {
    Init,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdResult {
    pub uuid: String,
    pub state: CmdState,
    /// Exit code of the underlying work; `None` until one is reported.
    pub exit_code: Option<i32>,
    pub out: String,
    pub err: String,
}

impl CmdResult {
    pub fn new(uuid: impl Into<String>) -> Self {
        CmdResult {
            uuid: uuid.into(),
            state: CmdState::Init,
            exit_code: None,
            out: String::new(),
            err: String::new(),
        }
    }

    /// Append a timestamped line to the captured stdout text.
    pub fn append_out(&mut self, line: &str) {
        append_line(&mut self.out, line);
    }

    /// Append a timestamped line to the captured stderr text.
    pub fn append_err(&mut self, line: &str) {
        append_line(&mut self.err, line);
    }

    pub fn has_completed(&self) -> bool {
        self.state == CmdState::Completed
    }
}

fn append_line(buf: &mut String, line: &str) {
    buf.push_str(&Utc::now().to_rfc3339());
    buf.push('\t');
    buf.push_str(line);
    buf.push('\n');
}

// ---------------------------------------------------------------------------
// NodeCmd
// ---------------------------------------------------------------------------

/// A command issued to a node's agent. The result is shared: the heartbeat
/// path fills it in as the agent reports progress, while the issuing action
/// polls `wait`.
#[derive(Debug, Clone)]
pub struct NodeCmd {
    uuid: String,
    command: String,
    issued_at: DateTime<Utc>,
    result: Arc<Mutex<CmdResult>>,
}

impl NodeCmd {
    pub fn new(uuid: impl Into<String>, command: impl Into<String>) -> Self {
        let uuid = uuid.into();
        NodeCmd {
            result: Arc::new(Mutex::new(CmdResult::new(uuid.clone()))),
            uuid,
            command: command.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Snapshot of the current result.
    pub fn result(&self) -> CmdResult {
        self.result.lock().unwrap().clone()
    }

    /// Mutate the shared result in place (agent report path).
    pub fn update_result(&self, f: impl FnOnce(&mut CmdResult)) {
        f(&mut self.result.lock().unwrap());
    }

    /// Mark the command completed with the given exit code and output.
    pub fn complete(&self, exit_code: i32, out: &str, err: &str) {
        self.update_result(|r| {
            r.state = CmdState::Completed;
            r.exit_code = Some(exit_code);
            if !out.is_empty() {
                r.append_out(out);
            }
            if !err.is_empty() {
                r.append_err(err);
            }
        });
    }

    pub fn mark_cancelled(&self) {
        self.update_result(|r| r.state = CmdState::Cancelled);
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.result.lock().unwrap().state,
            CmdState::Completed | CmdState::Cancelled
        )
    }

    /// Poll the shared result at 1s granularity until it settles or `timeout`
    /// elapses. Not interrupt-driven: an in-flight poll interval is always
    /// slept to completion.
    pub async fn wait(&self, timeout: Duration) -> Result<CmdResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_settled() {
                return Ok(self.result());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TillerError::WaitTimeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_lines_are_timestamped() {
        let mut r = CmdResult::new("u1");
        r.append_out("hello");
        r.append_err("oops");
        assert!(r.out.contains("hello"));
        assert!(r.out.ends_with('\n'));
        assert!(r.err.contains("oops"));
    }

    #[test]
    fn complete_fills_shared_result() {
        let cmd = NodeCmd::new("u1", RESTART_SERVICE_CMD);
        assert!(!cmd.is_settled());
        cmd.complete(0, "restarted", "");
        let r = cmd.result();
        assert!(r.has_completed());
        assert_eq!(r.exit_code, Some(0));
        assert!(r.out.contains("restarted"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_when_never_completed() {
        let cmd = NodeCmd::new("u1", STOP_SERVICE_CMD);
        let err = cmd.wait(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, TillerError::WaitTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_completed() {
        let cmd = NodeCmd::new("u1", START_SERVICE_CMD);
        let waiter = cmd.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cmd.complete(0, "ok", "");
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_cancellation() {
        let cmd = NodeCmd::new("u1", STOP_SERVICE_CMD);
        cmd.mark_cancelled();
        let result = cmd.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.state, CmdState::Cancelled);
    }
}
