//! Actions: units of executable work with an explicit lifecycle.
//!
//! An [`Action`] is a shell around a pluggable [`ActionTask`]: the shell owns
//! the cross-cutting state (status machine, result accumulation, children,
//! post-run sensor set, completion signal) while the task supplies the
//! business logic. The engine drives `run`, which walks the state machine:
//!
//! ```text
//! NOT_STARTED → RUNNING → { SUCCEEDED | FAILED | CANCELLED }
//! ```
//!
//! Success is explicit: a task that returns without calling
//! `mark_succeeded` stays non-terminal from the caller's perspective, though
//! completion (result state, complete time, audit hand-off) always fires.

pub mod audit;
pub mod engine;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error};

use crate::alert::{AlertLevel, AlertMessage};
use crate::attrs::Attribute;
use crate::cluster::Cluster;
use crate::command::{CmdResult, CmdState};
use crate::error::{Result, TillerError};
use crate::ids::TimeId;
use crate::plugin::PluginSettings;

use self::audit::ActionRecord;
use self::engine::ActionEngine;

/// Wall-clock budget for re-running publishing sensors after an action
/// completes. Sensors still running past it are abandoned, not cancelled.
pub const POST_RUN_SENSOR_BUDGET: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Status & type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Node,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// ActionTask
// ---------------------------------------------------------------------------

/// The pluggable part of an action.
#[async_trait]
pub trait ActionTask: Send + Sync + 'static {
    /// Implementation name, as registered in the action plugin registry.
    /// Admission resolves enablement and configuration through it.
    fn kind(&self) -> &str;

    /// Display name. Two proposals with the same kind and name are treated
    /// as the same logical action by the reconciliation loop.
    fn name(&self) -> String;

    fn action_type(&self) -> ActionType;

    /// Apply per-action configuration at admission time. Errors here are
    /// hard rejections.
    fn configure(&self, settings: &PluginSettings) -> Result<()> {
        let _ = settings;
        Ok(())
    }

    async fn execute(&self, cx: &ActionCx) -> Result<()>;

    /// Logical-identity check used by the plan reconciliation.
    fn is_same_as(&self, other: &dyn ActionTask) -> bool {
        self.kind() == other.kind() && self.name() == other.name()
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to one action. Clones share identity and state;
/// the reconciliation loop relies on this to preserve execution state across
/// plan commits.
#[derive(Clone)]
pub struct Action {
    inner: Arc<ActionInner>,
}

struct ActionInner {
    id: TimeId,
    task: Box<dyn ActionTask>,
    created_at: DateTime<Utc>,
    status: Mutex<ActionStatus>,
    result: Mutex<CmdResult>,
    owner: Mutex<Option<String>>,
    root: AtomicBool,
    children: Mutex<Vec<Action>>,
    post_run_sensors: Mutex<BTreeSet<String>>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
    done_tx: watch::Sender<bool>,
    abort: Mutex<Option<AbortHandle>>,
}

impl Action {
    pub fn new(task: Box<dyn ActionTask>) -> Self {
        let id = TimeId::now();
        let (done_tx, _) = watch::channel(false);
        Action {
            inner: Arc::new(ActionInner {
                result: Mutex::new(CmdResult::new(id.to_string())),
                id,
                task,
                created_at: Utc::now(),
                status: Mutex::new(ActionStatus::NotStarted),
                owner: Mutex::new(None),
                root: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
                post_run_sensors: Mutex::new(BTreeSet::new()),
                completed_at: Mutex::new(None),
                done_tx,
                abort: Mutex::new(None),
            }),
        }
    }

    /// Rebuild a tracked action from an audit record (startup replay). The
    /// resulting action carries its historic state and cannot be re-run.
    pub fn from_record(record: &ActionRecord) -> Result<Self> {
        let id: TimeId = record.uuid.parse()?;
        let children = record
            .children
            .iter()
            .map(Action::from_record)
            .collect::<Result<Vec<_>>>()?;
        let (done_tx, _) = watch::channel(record.status.is_terminal());
        let created_at = Utc
            .timestamp_millis_opt(record.create_time)
            .single()
            .ok_or_else(|| TillerError::InvalidId(record.uuid.clone()))?;
        let completed_at = record
            .complete_time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        Ok(Action {
            inner: Arc::new(ActionInner {
                id,
                task: Box::new(audit::HistoricTask {
                    name: record.name.clone(),
                    action_type: record.action_type,
                }),
                created_at,
                status: Mutex::new(record.status),
                result: Mutex::new(record.result.clone()),
                owner: Mutex::new(record.owner.clone()),
                root: AtomicBool::new(true),
                children: Mutex::new(children),
                post_run_sensors: Mutex::new(BTreeSet::new()),
                completed_at: Mutex::new(completed_at),
                done_tx,
                abort: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> TimeId {
        self.inner.id
    }

    pub fn kind(&self) -> &str {
        self.inner.task.kind()
    }

    pub fn name(&self) -> String {
        self.inner.task.name()
    }

    pub fn action_type(&self) -> ActionType {
        self.inner.task.action_type()
    }

    pub fn status(&self) -> ActionStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.inner.completed_at.lock().unwrap()
    }

    pub fn owner(&self) -> Option<String> {
        self.inner.owner.lock().unwrap().clone()
    }

    pub fn set_owner(&self, owner: impl Into<String>) {
        *self.inner.owner.lock().unwrap() = Some(owner.into());
    }

    pub fn is_root(&self) -> bool {
        self.inner.root.load(Ordering::Acquire)
    }

    pub(crate) fn set_root(&self, root: bool) {
        self.inner.root.store(root, Ordering::Release);
    }

    /// Snapshot of the result payload.
    pub fn result(&self) -> CmdResult {
        self.inner.result.lock().unwrap().clone()
    }

    pub fn children(&self) -> Vec<Action> {
        self.inner.children.lock().unwrap().clone()
    }

    pub(crate) fn add_child(&self, child: Action) {
        self.inner.children.lock().unwrap().push(child);
    }

    pub(crate) fn configure(&self, settings: &PluginSettings) -> Result<()> {
        self.inner.task.configure(settings)
    }

    pub(crate) fn set_abort_handle(&self, handle: AbortHandle) {
        *self.inner.abort.lock().unwrap() = Some(handle);
    }

    /// Logical-identity comparison for plan reconciliation.
    pub fn is_same_as(&self, other: &Action) -> bool {
        self.inner.task.is_same_as(other.inner.task.as_ref())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn mark_succeeded(&self) {
        *self.inner.status.lock().unwrap() = ActionStatus::Succeeded;
    }

    pub fn mark_failed(&self, error: impl std::fmt::Display) {
        *self.inner.status.lock().unwrap() = ActionStatus::Failed;
        self.inner
            .result
            .lock()
            .unwrap()
            .append_err(&error.to_string());
    }

    pub fn append_out(&self, line: &str) {
        self.inner.result.lock().unwrap().append_out(line);
    }

    pub fn append_err(&self, line: &str) {
        self.inner.result.lock().unwrap().append_err(line);
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Best-effort cancellation: abort the execution handle if one exists,
    /// then unconditionally flip status and result to CANCELLED. No rollback
    /// of partial side effects is attempted.
    pub fn cancel(&self) {
        if let Some(handle) = self.inner.abort.lock().unwrap().take() {
            handle.abort();
        }
        *self.inner.status.lock().unwrap() = ActionStatus::Cancelled;
        self.inner.result.lock().unwrap().state = CmdState::Cancelled;
        // send_replace updates the value even with no live receivers, so a
        // later wait() still observes completion.
        self.inner.done_tx.send_replace(true);
    }

    /// Block until the completion signal fires, then return the status.
    pub async fn wait(&self) -> ActionStatus {
        let mut rx = self.inner.done_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.status()
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<ActionStatus> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| TillerError::WaitTimeout)
    }

    /// Denormalized snapshot for auditing and the JSON surface.
    pub fn record(&self) -> ActionRecord {
        ActionRecord {
            uuid: self.id().to_string(),
            name: self.name(),
            action_type: self.action_type(),
            status: self.status(),
            create_time: self.inner.created_at.timestamp_millis(),
            complete_time: self.completed_at().map(|t| t.timestamp_millis()),
            owner: self.owner(),
            children: self.children().iter().map(Action::record).collect(),
            result: self.result(),
        }
    }

    // -----------------------------------------------------------------------
    // Execution (engine-driven)
    // -----------------------------------------------------------------------

    pub(crate) async fn run(&self, cluster: &Arc<Cluster>, engine: &Arc<ActionEngine>) {
        if self.status() == ActionStatus::Cancelled {
            return;
        }
        *self.inner.status.lock().unwrap() = ActionStatus::Running;
        self.inner.result.lock().unwrap().state = CmdState::Running;

        let cx = ActionCx {
            action: self.clone(),
            cluster: cluster.clone(),
            engine: engine.clone(),
        };
        match self.inner.task.execute(&cx).await {
            Ok(()) => self.refresh_post_run_sensors(cluster).await,
            Err(e) => {
                error!(
                    cluster = cluster.id(),
                    action = %self.id(),
                    error = %e,
                    "action failed"
                );
                self.mark_failed(&e);
            }
        }
        self.complete(engine).await;
    }

    /// Completion always fires, whatever the task did: result goes to
    /// COMPLETED, the complete time is stamped, root actions are handed to
    /// the auditor, and waiters are released.
    async fn complete(&self, engine: &Arc<ActionEngine>) {
        self.inner.result.lock().unwrap().state = CmdState::Completed;
        *self.inner.completed_at.lock().unwrap() = Some(Utc::now());
        if self.is_root() {
            engine.audit_completed(self).await;
        }
        self.inner.done_tx.send_replace(true);
    }

    /// Re-run the sensors that published the attributes this action read,
    /// bounded by [`POST_RUN_SENSOR_BUDGET`]. Failures become a warning in
    /// the result text; they never fail the action.
    async fn refresh_post_run_sensors(&self, cluster: &Arc<Cluster>) {
        let sensors: BTreeSet<String> = self.inner.post_run_sensors.lock().unwrap().clone();
        if sensors.is_empty() {
            return;
        }
        let Some(automation) = cluster.automation() else {
            return;
        };
        let waits = automation.trigger_sensors(&sensors);
        let deadline = tokio::time::Instant::now() + POST_RUN_SENSOR_BUDGET;
        let mut failures = Vec::new();
        for (key, rx) in waits {
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => failures.push(format!("{key}: {e}")),
                Ok(Err(_)) => failures.push(format!("{key}: sensor loop stopped")),
                Err(_) => {
                    // Budget exhausted. The remaining runs finish on their
                    // own; nobody waits for them.
                    debug!(
                        cluster = cluster.id(),
                        action = %self.id(),
                        "post-run sensor refresh budget exhausted"
                    );
                    break;
                }
            }
        }
        if !failures.is_empty() {
            self.append_out(&format!(
                "[WARNING] failed to refresh sensors after run: {}",
                failures.join("; ")
            ));
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id().to_string())
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("status", &self.status())
            .field("owner", &self.owner())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActionCx
// ---------------------------------------------------------------------------

/// Everything a task may touch while executing.
pub struct ActionCx {
    action: Action,
    cluster: Arc<Cluster>,
    engine: Arc<ActionEngine>,
}

impl ActionCx {
    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Read a cluster attribute, recording its publishing sensors for the
    /// post-run refresh.
    pub fn cluster_attribute(&self, key: &str) -> Option<Attribute> {
        let attr = self.cluster.attrs().get(key)?;
        if !attr.publishing_sensors.is_empty() {
            self.action
                .inner
                .post_run_sensors
                .lock()
                .unwrap()
                .extend(attr.publishing_sensors.iter().cloned());
        }
        Some(attr)
    }

    pub fn mark_succeeded(&self) {
        self.action.mark_succeeded();
    }

    pub fn append_out(&self, line: &str) {
        self.action.append_out(line);
    }

    pub fn append_err(&self, line: &str) {
        self.action.append_err(line);
    }

    /// Spawn a child action on the uncapped pool. The child inherits this
    /// action's owner and is recorded under its children.
    pub fn dispatch_child(&self, child: Action) -> Result<Action> {
        self.engine.dispatch_child(&self.action, child)
    }

    pub fn alert(&self, level: AlertLevel, message: AlertMessage) {
        self.engine.alert(level, message);
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn new_action_starts_clean() {
        let action = noop_action("a");
        assert_eq!(action.status(), ActionStatus::NotStarted);
        assert_eq!(action.result().state, CmdState::Init);
        assert!(action.owner().is_none());
        assert!(!action.is_root());
        assert!(action.children().is_empty());
    }

    #[test]
    fn clones_share_state() {
        let action = noop_action("a");
        let clone = action.clone();
        action.set_owner("ops");
        assert_eq!(clone.owner().as_deref(), Some("ops"));
        clone.mark_succeeded();
        assert_eq!(action.status(), ActionStatus::Succeeded);
    }

    #[test]
    fn same_kind_and_name_is_same_logical_action() {
        let a = noop_action("rebalance");
        let b = noop_action("rebalance");
        let c = noop_action("expand");
        assert!(a.is_same_as(&b));
        assert!(!a.is_same_as(&c));
        // Logical equality is not identity.
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn mark_failed_accumulates_err_text() {
        let action = noop_action("a");
        action.mark_failed("first");
        action.mark_failed("second");
        let result = action.result();
        assert!(result.err.contains("first"));
        assert!(result.err.contains("second"));
        assert_eq!(action.status(), ActionStatus::Failed);
    }

    #[test]
    fn cancel_flips_status_and_result() {
        let action = noop_action("a");
        action.cancel();
        assert_eq!(action.status(), ActionStatus::Cancelled);
        assert_eq!(action.result().state, CmdState::Cancelled);
        assert!(action.is_done());
    }

    #[tokio::test]
    async fn wait_timeout_expires_on_pending_action() {
        let action = noop_action("a");
        let err = action
            .wait_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TillerError::WaitTimeout));
    }

    #[tokio::test]
    async fn wait_returns_after_cancel() {
        let action = noop_action("a");
        let waiter = action.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        action.cancel();
        assert_eq!(handle.await.unwrap(), ActionStatus::Cancelled);
    }

    #[test]
    fn record_roundtrips_through_from_record() {
        let action = noop_action("rebalance");
        action.set_owner("ops");
        action.set_root(true);
        action.mark_succeeded();
        let record = action.record();

        let restored = Action::from_record(&record).unwrap();
        assert_eq!(restored.id(), action.id());
        assert_eq!(restored.name(), "rebalance");
        assert_eq!(restored.status(), ActionStatus::Succeeded);
        assert_eq!(restored.owner().as_deref(), Some("ops"));
    }

    #[test]
    fn record_serializes_to_camel_case_json() {
        let action = noop_action("a");
        let json = serde_json::to_value(action.record()).unwrap();
        assert!(json.get("uuid").is_some());
        assert!(json.get("createTime").is_some());
        assert!(json.get("completeTime").is_some());
        assert!(json["result"].get("exitCode").is_some());
        assert_eq!(json["status"], "NOT_STARTED");
    }
}
