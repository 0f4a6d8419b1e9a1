//! The operator executor: the per-cluster reconciliation loop.
//!
//! Every cycle evaluates all operators, collecting their proposals into the
//! scratch *shadow* plan, then commits the shadow against the standing
//! *actual* plan. The commit is a prefix reconciliation, not a general diff:
//! operators are expected to re-propose a stable, deterministically ordered
//! plan each cycle, and the commit only detects how much of the previously
//! committed plan the new proposal still endorses, preserving the
//! already-executed action objects for that prefix so execution state is not
//! lost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::action::engine::ActionEngine;
use crate::action::Action;
use crate::cluster::Cluster;
use crate::metrics::{incr, Metrics};
use crate::operator::OperatorContainer;

/// Owner stamped on every automation-dispatched action.
pub const AUTOMATION_OWNER: &str = "tiller";

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// The executor's reconciliation state: the standing plan, this cycle's
/// proposal, and the cursor marking the next action to dispatch.
#[derive(Default)]
struct Plan {
    actual: Vec<Action>,
    shadow: Vec<Action>,
    next_idx: usize,
}

impl Plan {
    /// Commit the shadow plan. Walks `actual[0..next_idx)` and `shadow` in
    /// lock-step while the entries are the same logical action, replacing
    /// the shadow entry with the already-executed actual object; stops at
    /// the first failed comparison. The match count becomes the new
    /// `next_idx`, the lists swap, and the new shadow is cleared for the
    /// next cycle.
    fn commit(&mut self) {
        let mut matched = 0;
        while matched < self.next_idx
            && matched < self.shadow.len()
            && self.actual[matched].is_same_as(&self.shadow[matched])
        {
            self.shadow[matched] = self.actual[matched].clone();
            matched += 1;
        }
        std::mem::swap(&mut self.actual, &mut self.shadow);
        self.next_idx = matched;
        self.shadow.clear();
    }

    /// The next action to dispatch, if the plan has one.
    fn next_action(&self) -> Option<Action> {
        self.actual.get(self.next_idx).cloned()
    }

    fn has_more(&self) -> bool {
        self.next_idx < self.actual.len()
    }
}

// ---------------------------------------------------------------------------
// OperatorExecutor
// ---------------------------------------------------------------------------

pub struct OperatorExecutor {
    cluster: Arc<Cluster>,
    engine: Arc<ActionEngine>,
    operators: Vec<Arc<OperatorContainer>>,
    interval: Duration,
    metrics: Arc<Metrics>,
    plan: Mutex<Plan>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OperatorExecutor {
    pub fn new(
        cluster: Arc<Cluster>,
        engine: Arc<ActionEngine>,
        operators: Vec<Arc<OperatorContainer>>,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(OperatorExecutor {
            cluster,
            engine,
            operators,
            interval,
            metrics,
            plan: Mutex::new(Plan::default()),
            task: Mutex::new(None),
        })
    }

    pub fn operators(&self) -> &[Arc<OperatorContainer>] {
        &self.operators
    }

    /// Start the evaluation loop on its own dedicated task. The loop is the
    /// only mutator of the plan, so cycles never race each other.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let executor = self.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(executor.interval).await;
                // Drain the plan with 0-delay cycles while dispatches keep
                // landing, then fall back to the fixed cadence.
                while executor.run_cycle().await {}
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// One evaluate/commit/dispatch cycle. Returns `true` when the next
    /// cycle should run immediately (a dispatch landed and the plan still
    /// has more work).
    pub(crate) async fn run_cycle(&self) -> bool {
        if self.cluster.is_under_maintenance() {
            info!(
                cluster = self.cluster.id(),
                "cluster is under maintenance, skipping operator evaluation"
            );
            return false;
        }

        // Evaluate operators in registration order; each appends proposals
        // to the shadow list. Failures are isolated by the containers.
        let mut proposals = Vec::new();
        for container in &self.operators {
            container.operate(&self.cluster, &mut proposals).await;
        }
        incr(&self.metrics.operator_cycles);

        let next = {
            let mut plan = self.plan.lock().unwrap();
            plan.shadow = proposals;
            plan.commit();
            plan.next_action()
        };

        let Some(action) = next else {
            return false;
        };
        action.set_owner(AUTOMATION_OWNER);
        match self.engine.dispatch_now(action.clone()) {
            Ok(true) => {
                info!(
                    cluster = self.cluster.id(),
                    action = %action.id(),
                    name = %action.name(),
                    "dispatched action from plan"
                );
                let mut plan = self.plan.lock().unwrap();
                plan.next_idx += 1;
                plan.has_more()
            }
            Ok(false) => {
                info!(
                    cluster = self.cluster.id(),
                    name = %action.name(),
                    "skipped dispatch, another action is already active"
                );
                false
            }
            Err(e) => {
                error!(
                    cluster = self.cluster.id(),
                    name = %action.name(),
                    error = %e,
                    "failed to dispatch action from plan"
                );
                action.mark_failed(&e);
                false
            }
        }
    }

    /// Snapshot of the standing plan and cursor, newest commit first.
    pub fn plan_snapshot(&self) -> (Vec<Action>, usize) {
        let plan = self.plan.lock().unwrap();
        (plan.actual.clone(), plan.next_idx)
    }

    #[cfg(test)]
    fn load_plan(&self, actual: Vec<Action>, shadow: Vec<Action>, next_idx: usize) {
        let mut plan = self.plan.lock().unwrap();
        plan.actual = actual;
        plan.shadow = shadow;
        plan.next_idx = next_idx;
    }

    #[cfg(test)]
    fn commit_plan(&self) {
        self.plan.lock().unwrap().commit();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
