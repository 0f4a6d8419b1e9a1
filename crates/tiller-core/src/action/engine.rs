//! The per-cluster action engine: admission control, root-action
//! serialization, tracking, eviction, alert fan-out, and audit hand-off.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::alert::{AlertLevel, AlertMessage};
use crate::cluster::Cluster;
use crate::error::{Result, TillerError};
use crate::ids::TimeId;
use crate::metrics::{incr, Metrics};
use crate::plugin::Registries;

use super::audit::ActionAuditor;
use super::{Action, ActionStatus};

/// Completed actions are evicted from the tracked map after this long.
const TRACKED_ACTION_TTL_HOURS: i64 = 24;

/// Cadence of the eviction sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct ActionEngine {
    cluster: Arc<Cluster>,
    registries: Arc<Registries>,
    auditor: Option<Arc<dyn ActionAuditor>>,
    metrics: Arc<Metrics>,
    /// Tracked actions in id (= time) order; listings iterate in reverse for
    /// newest-first.
    tracked: Mutex<BTreeMap<TimeId, Action>>,
    alerts: Mutex<BTreeMap<TimeId, AlertMessage>>,
    /// Root actions admitted but not yet finished. Non-zero means the
    /// single execution slot is taken (or spoken for by the queue).
    active: AtomicUsize,
    /// Serializes the check-then-admit step of `dispatch_now` against other
    /// admissions.
    admission: Mutex<()>,
    root_tx: mpsc::UnboundedSender<Action>,
    root_rx: Mutex<Option<mpsc::UnboundedReceiver<Action>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ActionEngine {
    pub fn new(
        cluster: Arc<Cluster>,
        registries: Arc<Registries>,
        auditor: Option<Arc<dyn ActionAuditor>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (root_tx, root_rx) = mpsc::unbounded_channel();
        Arc::new(ActionEngine {
            cluster,
            registries,
            auditor,
            metrics,
            tracked: Mutex::new(BTreeMap::new()),
            alerts: Mutex::new(BTreeMap::new()),
            active: AtomicUsize::new(0),
            admission: Mutex::new(()),
            root_tx,
            root_rx: Mutex::new(Some(root_rx)),
            runner: Mutex::new(None),
            sweeper: Mutex::new(None),
        })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Spawn the root-action runner and the eviction sweeper.
    pub fn start(self: &Arc<Self>) {
        let mut runner = self.runner.lock().unwrap();
        if runner.is_some() {
            return;
        }
        let Some(rx) = self.root_rx.lock().unwrap().take() else {
            return;
        };
        *runner = Some(tokio::spawn(Self::run_roots(self.clone(), rx)));
        *self.sweeper.lock().unwrap() = Some(tokio::spawn(Self::run_sweeper(self.clone())));
    }

    pub fn stop(&self) {
        if let Some(task) = self.runner.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.sweeper.lock().unwrap().take() {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Admit a root action and queue it for serialized execution.
    pub fn dispatch(self: &Arc<Self>, action: Action) -> Result<()> {
        self.admit(&action)?;
        let _guard = self.admission.lock().unwrap();
        self.submit(action);
        Ok(())
    }

    /// Like `dispatch`, but refuses instead of queueing: returns `false`
    /// with no side effects when another root action is already active.
    /// This is the automation loop's backpressure valve.
    pub fn dispatch_now(self: &Arc<Self>, action: Action) -> Result<bool> {
        self.admit(&action)?;
        if self.active.load(Ordering::Acquire) == 0 {
            let _guard = self.admission.lock().unwrap();
            if self.active.load(Ordering::Acquire) == 0 {
                self.submit(action);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Spawn a child action on the uncapped pool. Children inherit the
    /// parent's owner, are recorded under the parent, and are neither
    /// serialized nor audited as roots.
    pub fn dispatch_child(self: &Arc<Self>, parent: &Action, child: Action) -> Result<Action> {
        if let Some(key) = self.registries.actions.key_for_plugin(child.kind()) {
            child
                .configure(&self.registries.actions.settings_for(self.cluster.id(), &key))?;
        }
        if let Some(owner) = parent.owner() {
            child.set_owner(owner);
        }
        child.set_root(false);
        parent.add_child(child.clone());

        let cluster = self.cluster.clone();
        let engine = self.clone();
        let running = child.clone();
        let handle = tokio::spawn(async move { running.run(&cluster, &engine).await });
        child.set_abort_handle(handle.abort_handle());
        Ok(child)
    }

    /// Admission checks shared by `dispatch` and `dispatch_now`: the action
    /// kind must be enabled on this cluster, the owner must be set, and the
    /// per-action configuration must apply cleanly. All failures are hard
    /// rejections before any engine state changes.
    fn admit(self: &Arc<Self>, action: &Action) -> Result<()> {
        let cluster_id = self.cluster.id();
        let key = self.registries.actions.key_for_plugin(action.kind());
        let enabled = key
            .as_deref()
            .map(|k| self.registries.actions.is_enabled(cluster_id, k))
            .unwrap_or(false);
        if !enabled {
            self.alert(
                AlertLevel::Medium,
                AlertMessage::new(
                    format!("Action blocked on cluster {cluster_id}"),
                    format!(
                        "Action {} is blocked on cluster {cluster_id}",
                        action.name()
                    ),
                    action.owner().unwrap_or_default(),
                )
                .with_entity(cluster_id),
            );
            return Err(TillerError::ActionDisabled {
                action: action.kind().to_string(),
                cluster: cluster_id.to_string(),
            });
        }
        if action.owner().is_none() {
            return Err(TillerError::MissingOwner);
        }
        let key = key.unwrap_or_default();
        action.configure(&self.registries.actions.settings_for(cluster_id, &key))?;
        action.set_root(true);
        Ok(())
    }

    fn submit(self: &Arc<Self>, action: Action) {
        let cluster_id = self.cluster.id();
        self.alert(
            AlertLevel::Medium,
            AlertMessage::new(
                format!("Action triggered on cluster {cluster_id}"),
                format!(
                    "Action {} scheduled on cluster {cluster_id}",
                    action.name()
                ),
                action.owner().unwrap_or_default(),
            )
            .with_entity(cluster_id),
        );
        self.tracked
            .lock()
            .unwrap()
            .insert(action.id(), action.clone());
        self.active.fetch_add(1, Ordering::AcqRel);
        incr(&self.metrics.actions_dispatched);
        let _ = self.root_tx.send(action);
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    /// Resolve the enabled alert plugins serving `level` on this cluster and
    /// dispatch the message to each on its own task. Delivery failures are
    /// logged, never propagated.
    pub fn alert(self: &Arc<Self>, level: AlertLevel, message: AlertMessage) {
        self.alerts
            .lock()
            .unwrap()
            .insert(message.id, message.clone());
        let instances = match self.registries.alerts_for_level(self.cluster.id(), level) {
            Ok(instances) => instances,
            Err(e) => {
                error!(cluster = self.cluster.id(), error = %e, "failed to resolve alert plugins");
                return;
            }
        };
        for (key, alert) in instances {
            let msg = message.clone();
            let metrics = self.metrics.clone();
            let cluster_id = self.cluster.id().to_string();
            tokio::spawn(async move {
                match alert.send(&msg).await {
                    Ok(()) => incr(&metrics.alerts_dispatched),
                    Err(e) => {
                        error!(cluster = cluster_id, alert = key, error = %e, "alert delivery failed");
                    }
                }
            });
        }
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub(crate) async fn audit_completed(&self, action: &Action) {
        let Some(auditor) = &self.auditor else {
            return;
        };
        if let Err(e) = auditor.log_action(self.cluster.id(), &action.record()).await {
            error!(
                cluster = self.cluster.id(),
                action = %action.id(),
                error = %e,
                "failed to log action to auditor"
            );
        }
    }

    /// Insert a replayed action into the tracked map without admission.
    pub fn restore(&self, action: Action) {
        self.tracked.lock().unwrap().insert(action.id(), action);
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn tracked_actions(&self) -> Vec<Action> {
        self.tracked
            .lock()
            .unwrap()
            .values()
            .rev()
            .cloned()
            .collect()
    }

    pub fn running_actions(&self) -> Vec<Action> {
        self.tracked
            .lock()
            .unwrap()
            .values()
            .rev()
            .filter(|a| !a.is_done())
            .cloned()
            .collect()
    }

    pub fn action(&self, id: &TimeId) -> Option<Action> {
        self.tracked.lock().unwrap().get(id).cloned()
    }

    pub fn action_by_str(&self, id: &str) -> Result<Option<Action>> {
        Ok(self.action(&id.parse()?))
    }

    pub fn alerts(&self) -> Vec<AlertMessage> {
        self.alerts
            .lock()
            .unwrap()
            .values()
            .rev()
            .cloned()
            .collect()
    }

    pub fn mark_alert_read(&self, id: &TimeId) -> bool {
        match self.alerts.lock().unwrap().get_mut(id) {
            Some(alert) => {
                alert.read = true;
                true
            }
            None => false,
        }
    }

    /// Number of admitted root actions not yet finished.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn run_roots(engine: Arc<ActionEngine>, mut rx: mpsc::UnboundedReceiver<Action>) {
        while let Some(action) = rx.recv().await {
            // Cancelled while still queued: release the slot and move on.
            if action.is_done() {
                engine.active.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            let cluster = engine.cluster.clone();
            let eng = engine.clone();
            let running = action.clone();
            let handle = tokio::spawn(async move { running.run(&cluster, &eng).await });
            action.set_abort_handle(handle.abort_handle());
            let _ = handle.await;
            match action.status() {
                ActionStatus::Succeeded => incr(&engine.metrics.actions_succeeded),
                ActionStatus::Failed => incr(&engine.metrics.actions_failed),
                _ => {}
            }
            engine.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    async fn run_sweeper(engine: Arc<ActionEngine>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = engine.evict_expired(Utc::now());
            if evicted > 0 {
                info!(
                    cluster = engine.cluster.id(),
                    evicted, "evicted actions completed over 24h ago"
                );
            }
        }
    }

    pub(crate) fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::hours(TRACKED_ACTION_TTL_HOURS);
        let mut tracked = self.tracked.lock().unwrap();
        let before = tracked.len();
        tracked.retain(|_, action| match (action.is_done(), action.completed_at()) {
            (true, Some(done_at)) => now.signed_duration_since(done_at) <= ttl,
            _ => true,
        });
        let evicted = before - tracked.len();
        for _ in 0..evicted {
            incr(&self.metrics.actions_evicted);
        }
        evicted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::audit::ActionRecord;
    use crate::action::test_support::*;
    use crate::action::{ActionCx, ActionTask, ActionType};
    use crate::command::CmdState;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn engine() -> (Arc<ActionEngine>, Arc<Cluster>) {
        let cluster = Cluster::new("kafka-test-1", "Kafka Test", "kafka");
        let engine = ActionEngine::new(
            cluster.clone(),
            test_registries(),
            None,
            Metrics::new(),
        );
        engine.start();
        (engine, cluster)
    }

    fn gate_action(name: &str, release: Arc<Notify>) -> Action {
        let action = Action::new(Box::new(GateTask {
            name: name.into(),
            release,
        }));
        action.set_owner("ops");
        action
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn dispatch_now_refuses_while_a_root_is_active() {
        let (engine, _cluster) = engine();
        let release = Arc::new(Notify::new());
        let a1 = gate_action("g1", release.clone());

        assert!(engine.dispatch_now(a1.clone()).unwrap());
        {
            let a1 = a1.clone();
            wait_for(move || a1.status() == ActionStatus::Running).await;
        }

        // Slot taken: no admission, no tracking.
        let a2 = gate_action("g2", release.clone());
        assert!(!engine.dispatch_now(a2.clone()).unwrap());
        assert_eq!(a2.status(), ActionStatus::NotStarted);
        assert!(engine.action(&a2.id()).is_none());

        release.notify_one();
        a1.wait().await;
        {
            let engine = engine.clone();
            wait_for(move || engine.active_count() == 0).await;
        }

        // Slot free again.
        let a3 = gate_action("g3", release.clone());
        assert!(engine.dispatch_now(a3.clone()).unwrap());
        release.notify_one();
        assert_eq!(a3.wait().await, ActionStatus::Succeeded);
        engine.stop();
    }

    #[tokio::test]
    async fn queued_roots_run_strictly_one_at_a_time() {
        let (engine, _cluster) = engine();
        let r1 = Arc::new(Notify::new());
        let r2 = Arc::new(Notify::new());
        let a1 = gate_action("g1", r1.clone());
        let a2 = gate_action("g2", r2.clone());

        engine.dispatch(a1.clone()).unwrap();
        engine.dispatch(a2.clone()).unwrap();
        {
            let a1 = a1.clone();
            wait_for(move || a1.status() == ActionStatus::Running).await;
        }
        // The second stays queued while the first holds the slot.
        assert_eq!(a2.status(), ActionStatus::NotStarted);

        r1.notify_one();
        assert_eq!(a1.wait().await, ActionStatus::Succeeded);
        {
            let a2 = a2.clone();
            wait_for(move || a2.status() == ActionStatus::Running).await;
        }
        r2.notify_one();
        assert_eq!(a2.wait().await, ActionStatus::Succeeded);
        engine.stop();
    }

    #[tokio::test]
    async fn failing_task_completes_with_failed_status() {
        let (engine, _cluster) = engine();
        let action = Action::new(Box::new(FailTask));
        action.set_owner("ops");

        engine.dispatch(action.clone()).unwrap();
        assert_eq!(action.wait().await, ActionStatus::Failed);
        let result = action.result();
        assert_eq!(result.state, CmdState::Completed);
        assert!(result.err.contains("simulated breakage"));
        assert!(action.completed_at().is_some());
        engine.stop();
    }

    #[tokio::test]
    async fn missing_owner_is_rejected_before_running() {
        let (engine, _cluster) = engine();
        let action = noop_action("a");

        let err = engine.dispatch(action.clone()).unwrap_err();
        assert!(matches!(err, TillerError::MissingOwner));
        assert_eq!(action.status(), ActionStatus::NotStarted);
        assert!(engine.tracked_actions().is_empty());
        assert_eq!(engine.active_count(), 0);
        engine.stop();
    }

    #[tokio::test]
    async fn unconfigured_action_kind_is_blocked_with_alert() {
        let (engine, _cluster) = engine();

        struct RogueTask;

        #[async_trait]
        impl ActionTask for RogueTask {
            fn kind(&self) -> &str {
                "rogue"
            }
            fn name(&self) -> String {
                "rogue".into()
            }
            fn action_type(&self) -> ActionType {
                ActionType::Cluster
            }
            async fn execute(&self, _cx: &ActionCx) -> Result<()> {
                Ok(())
            }
        }

        let action = Action::new(Box::new(RogueTask));
        action.set_owner("ops");
        let err = engine.dispatch(action).unwrap_err();
        assert!(matches!(err, TillerError::ActionDisabled { .. }));
        assert!(engine.tracked_actions().is_empty());
        // The rejection itself raised a blocked-action alert.
        assert!(engine
            .alerts()
            .iter()
            .any(|a| a.title.contains("blocked")));
        engine.stop();
    }

    #[tokio::test]
    async fn children_inherit_owner_and_are_recorded() {
        let (engine, _cluster) = engine();

        struct SpawningTask;

        #[async_trait]
        impl ActionTask for SpawningTask {
            fn kind(&self) -> &str {
                "noop"
            }
            fn name(&self) -> String {
                "spawning".into()
            }
            fn action_type(&self) -> ActionType {
                ActionType::Cluster
            }
            async fn execute(&self, cx: &ActionCx) -> Result<()> {
                let child = cx.dispatch_child(noop_action("child"))?;
                child.wait().await;
                cx.mark_succeeded();
                Ok(())
            }
        }

        let parent = Action::new(Box::new(SpawningTask));
        parent.set_owner("ops");
        engine.dispatch(parent.clone()).unwrap();
        assert_eq!(parent.wait().await, ActionStatus::Succeeded);

        let children = parent.children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].owner().as_deref(), Some("ops"));
        assert!(!children[0].is_root());
        assert_eq!(children[0].status(), ActionStatus::Succeeded);
        engine.stop();
    }

    #[tokio::test]
    async fn cancelled_queued_action_is_skipped() {
        let (engine, _cluster) = engine();
        let release = Arc::new(Notify::new());
        let a1 = gate_action("g1", release.clone());
        let a2 = gate_action("g2", release.clone());

        engine.dispatch(a1.clone()).unwrap();
        engine.dispatch(a2.clone()).unwrap();
        a2.cancel();

        release.notify_one();
        a1.wait().await;
        {
            let engine = engine.clone();
            wait_for(move || engine.active_count() == 0).await;
        }
        assert_eq!(a2.status(), ActionStatus::Cancelled);
        engine.stop();
    }

    #[tokio::test]
    async fn eviction_removes_only_long_completed_actions() {
        let (engine, _cluster) = engine();

        let mut record = noop_action("old").record();
        record.status = ActionStatus::Succeeded;
        record.complete_time = Some((Utc::now() - chrono::Duration::hours(25)).timestamp_millis());
        engine.restore(Action::from_record(&record).unwrap());

        let mut fresh = noop_action("fresh").record();
        fresh.status = ActionStatus::Succeeded;
        fresh.complete_time = Some(Utc::now().timestamp_millis());
        engine.restore(Action::from_record(&fresh).unwrap());

        assert_eq!(engine.tracked_actions().len(), 2);
        let evicted = engine.evict_expired(Utc::now());
        assert_eq!(evicted, 1);
        let remaining = engine.tracked_actions();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name(), "fresh");
        engine.stop();
    }

    #[tokio::test]
    async fn tracked_listing_is_newest_first() {
        let (engine, _cluster) = engine();
        for (i, ms) in [1_000i64, 2_000, 3_000].iter().enumerate() {
            let record = ActionRecord {
                uuid: crate::ids::TimeId::from_parts(*ms, uuid::Uuid::new_v4()).to_string(),
                name: format!("a{i}"),
                action_type: ActionType::Cluster,
                status: ActionStatus::Succeeded,
                create_time: *ms,
                complete_time: Some(*ms),
                owner: Some("ops".into()),
                children: vec![],
                result: crate::command::CmdResult::new("r"),
            };
            engine.restore(Action::from_record(&record).unwrap());
        }
        let names: Vec<String> = engine.tracked_actions().iter().map(Action::name).collect();
        assert_eq!(names, vec!["a2", "a1", "a0"]);
        engine.stop();
    }
}
