//! Operators read the attribute store and propose corrective actions.
//!
//! An operator is stateless across cycles: anything it needs to remember
//! belongs in the attribute store. Dispatching an action from inside
//! `operate` only appends it to the executor's shadow plan for this cycle;
//! nothing reaches the action engine until the plan is committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::error;

use crate::action::Action;
use crate::cluster::Cluster;
use crate::error::Result;
use crate::metrics::{incr, Metrics};

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// Per-cycle context: the cluster under evaluation, the proposal sink, and an
/// outcome message slot surfaced by the container.
pub struct OperatorCx<'a> {
    cluster: &'a Arc<Cluster>,
    proposals: &'a mut Vec<Action>,
    message: String,
}

impl<'a> OperatorCx<'a> {
    pub fn cluster(&self) -> &Arc<Cluster> {
        self.cluster
    }

    /// Propose an action for this cycle's plan.
    pub fn dispatch(&mut self, action: Action) {
        self.proposals.push(action);
    }

    /// Record a human-readable summary of what this cycle decided.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }
}

#[async_trait]
pub trait Operator: Send + Sync {
    fn name(&self) -> String;

    async fn operate(&self, cx: &mut OperatorCx<'_>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// OperatorContainer
// ---------------------------------------------------------------------------

/// Wraps one operator, isolating its failures from the evaluation loop and
/// retaining the last outcome for introspection.
pub struct OperatorContainer {
    key: String,
    operator: Box<dyn Operator>,
    metrics: Arc<Metrics>,
    last_success: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_output: Mutex<String>,
}

impl OperatorContainer {
    pub fn new(key: impl Into<String>, operator: Box<dyn Operator>, metrics: Arc<Metrics>) -> Self {
        OperatorContainer {
            key: key.into(),
            operator,
            metrics,
            last_success: AtomicBool::new(true),
            last_error: Mutex::new(None),
            last_output: Mutex::new(String::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator_name(&self) -> String {
        self.operator.name()
    }

    pub fn last_success(&self) -> bool {
        self.last_success.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn last_output(&self) -> String {
        self.last_output.lock().unwrap().clone()
    }

    /// Evaluate the operator once, appending its proposals to `shadow`. A
    /// failing operator contributes nothing this cycle but is evaluated again
    /// on the next one.
    pub async fn operate(&self, cluster: &Arc<Cluster>, shadow: &mut Vec<Action>) {
        let mut cx = OperatorCx {
            cluster,
            proposals: shadow,
            message: String::new(),
        };
        match self.operator.operate(&mut cx).await {
            Ok(()) => {
                self.last_success.store(true, Ordering::Release);
                *self.last_error.lock().unwrap() = None;
            }
            Err(e) => {
                error!(
                    cluster = cluster.id(),
                    operator = self.key,
                    error = %e,
                    "operator failed"
                );
                self.last_success.store(false, Ordering::Release);
                *self.last_error.lock().unwrap() = Some(e.to_string());
                incr(&self.metrics.operator_failures);
            }
        }
        *self.last_output.lock().unwrap() = cx.message;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::noop_action;
    use crate::error::TillerError;

    struct ProposeOne;

    #[async_trait]
    impl Operator for ProposeOne {
        fn name(&self) -> String {
            "propose-one".into()
        }

        async fn operate(&self, cx: &mut OperatorCx<'_>) -> Result<()> {
            cx.dispatch(noop_action("a"));
            cx.set_message("proposed 1 action");
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Operator for AlwaysFails {
        fn name(&self) -> String {
            "always-fails".into()
        }

        async fn operate(&self, _cx: &mut OperatorCx<'_>) -> Result<()> {
            Err(TillerError::Plugin("no quorum data".into()))
        }
    }

    #[tokio::test]
    async fn proposals_and_message_are_captured() {
        let cluster = Cluster::new("c1", "C1", "kafka");
        let container = OperatorContainer::new("p1", Box::new(ProposeOne), Metrics::new());
        let mut shadow = Vec::new();
        container.operate(&cluster, &mut shadow).await;

        assert_eq!(shadow.len(), 1);
        assert!(container.last_success());
        assert_eq!(container.last_output(), "proposed 1 action");
    }

    #[tokio::test]
    async fn failure_is_isolated_and_recorded() {
        let cluster = Cluster::new("c1", "C1", "kafka");
        let container = OperatorContainer::new("f1", Box::new(AlwaysFails), Metrics::new());
        let mut shadow = Vec::new();
        container.operate(&cluster, &mut shadow).await;

        assert!(shadow.is_empty());
        assert!(!container.last_success());
        assert!(container.last_error().unwrap().contains("no quorum data"));
    }
}
