//! Per-cluster automation bundle: the sensor containers and the operator
//! executor, wired to the cluster's action engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::action::engine::ActionEngine;
use crate::cluster::Cluster;
use crate::executor::OperatorExecutor;
use crate::metrics::Metrics;
use crate::operator::{Operator, OperatorContainer};
use crate::sensor::{Sensor, SensorContainer, SensorRunOutcome};

pub struct AutomationEngine {
    cluster: Arc<Cluster>,
    sensors: BTreeMap<String, Arc<SensorContainer>>,
    executor: Arc<OperatorExecutor>,
}

impl AutomationEngine {
    pub fn new(
        cluster: Arc<Cluster>,
        engine: Arc<ActionEngine>,
        sensors: Vec<(String, Box<dyn Sensor>)>,
        operators: Vec<(String, Box<dyn Operator>)>,
        operator_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let sensors: BTreeMap<String, Arc<SensorContainer>> = sensors
            .into_iter()
            .map(|(key, sensor)| {
                let container =
                    SensorContainer::new(key.clone(), sensor, cluster.clone(), metrics.clone());
                (key, container)
            })
            .collect();
        let containers: Vec<Arc<OperatorContainer>> = operators
            .into_iter()
            .map(|(key, operator)| Arc::new(OperatorContainer::new(key, operator, metrics.clone())))
            .collect();
        let executor = OperatorExecutor::new(
            cluster.clone(),
            engine,
            containers,
            operator_interval,
            metrics,
        );
        Arc::new(AutomationEngine {
            cluster,
            sensors,
            executor,
        })
    }

    /// Start every sensor loop and the operator executor.
    pub fn start(&self) {
        for container in self.sensors.values() {
            container.start();
        }
        self.executor.start();
    }

    pub fn stop(&self) {
        for container in self.sensors.values() {
            container.stop();
        }
        self.executor.stop();
    }

    /// Force-refresh the named sensors, returning one completion handle per
    /// sensor actually known to this cluster. Unknown keys are skipped: the
    /// caller is doing a best-effort refresh, not a lookup.
    pub fn trigger_sensors(
        &self,
        keys: &BTreeSet<String>,
    ) -> Vec<(String, oneshot::Receiver<SensorRunOutcome>)> {
        let mut waits = Vec::new();
        for key in keys {
            match self.sensors.get(key) {
                Some(container) => {
                    debug!(cluster = self.cluster.id(), sensor = %key, "triggering sensor");
                    waits.push((key.clone(), container.trigger_now()));
                }
                None => {
                    debug!(
                        cluster = self.cluster.id(),
                        sensor = %key,
                        "skipping trigger for unknown sensor"
                    );
                }
            }
        }
        waits
    }

    pub fn sensor(&self, key: &str) -> Option<Arc<SensorContainer>> {
        self.sensors.get(key).cloned()
    }

    pub fn sensors(&self) -> Vec<Arc<SensorContainer>> {
        self.sensors.values().cloned().collect()
    }

    pub fn operator_executor(&self) -> &Arc<OperatorExecutor> {
        &self.executor
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::test_registries;
    use crate::error::Result;
    use crate::sensor::SensorCx;
    use async_trait::async_trait;
    use serde_json::json;

    struct TickSensor;

    #[async_trait]
    impl Sensor for TickSensor {
        fn name(&self) -> String {
            "tick".into()
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }

        async fn observe(&self, cx: &SensorCx<'_>) -> Result<()> {
            cx.publish("tick", json!(true));
            Ok(())
        }
    }

    fn automation() -> Arc<AutomationEngine> {
        let cluster = Cluster::new("c1", "C1", "kafka");
        let engine = ActionEngine::new(
            cluster.clone(),
            test_registries(),
            None,
            Metrics::new(),
        );
        AutomationEngine::new(
            cluster,
            engine,
            vec![("tick".to_string(), Box::new(TickSensor))],
            vec![],
            Duration::from_secs(30),
            Metrics::new(),
        )
    }

    #[tokio::test]
    async fn trigger_sensors_skips_unknown_keys() {
        let automation = automation();
        automation.start();

        let keys = BTreeSet::from(["tick".to_string(), "ghost".to_string()]);
        let waits = automation.trigger_sensors(&keys);
        assert_eq!(waits.len(), 1);
        assert_eq!(waits[0].0, "tick");
        automation.stop();
    }

    #[tokio::test]
    async fn triggered_sensor_completes_its_handle() {
        let automation = automation();
        automation.start();

        let keys = BTreeSet::from(["tick".to_string()]);
        let waits = automation.trigger_sensors(&keys);
        let (_, rx) = waits.into_iter().next().unwrap();
        let outcome = rx.await.unwrap();
        assert!(outcome.is_ok());
        automation.stop();
    }
}
