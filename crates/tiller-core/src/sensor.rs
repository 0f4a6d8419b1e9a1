//! Sensors observe the managed system and publish derived facts into the
//! cluster's attribute store.
//!
//! The container owns scheduling: each run is followed by a wait of
//! `interval()` measured from the run's *completion*, so a slow sensor can
//! never overlap itself or monopolize the shared pool. A forced refresh
//! (`trigger_now`) cancels the pending wait and runs immediately, handing the
//! caller a one-shot handle that resolves with that run's outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cluster::Cluster;
use crate::error::Result;
use crate::metrics::{incr, Metrics};

/// Outcome of a single observe run, cloneable for fan-out to waiters.
pub type SensorRunOutcome = std::result::Result<(), String>;

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

/// Context handed to each observe run. Publishing through it attributes every
/// write to the sensor's config key, which is what the post-action refresh
/// path resolves.
pub struct SensorCx<'a> {
    cluster: &'a Arc<Cluster>,
    sensor_key: &'a str,
}

impl<'a> SensorCx<'a> {
    pub fn cluster(&self) -> &Arc<Cluster> {
        self.cluster
    }

    pub fn sensor_key(&self) -> &str {
        self.sensor_key
    }

    pub fn publish(&self, key: &str, value: Value) {
        self.cluster.attrs().set(key, value, self.sensor_key);
    }

    pub fn publish_hidden(&self, key: &str, value: Value) {
        self.cluster.attrs().set_hidden(key, value, self.sensor_key);
    }
}

#[async_trait]
pub trait Sensor: Send + Sync {
    fn name(&self) -> String;

    /// Cadence between runs, measured from run completion.
    fn interval(&self) -> Duration;

    async fn observe(&self, cx: &SensorCx<'_>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SensorContainer
// ---------------------------------------------------------------------------

pub struct SensorContainer {
    key: String,
    sensor: Arc<dyn Sensor>,
    cluster: Arc<Cluster>,
    metrics: Arc<Metrics>,
    last_success: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_finished_at: Mutex<Option<DateTime<Utc>>>,
    trigger_tx: mpsc::UnboundedSender<oneshot::Sender<SensorRunOutcome>>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<oneshot::Sender<SensorRunOutcome>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SensorContainer {
    pub fn new(
        key: impl Into<String>,
        sensor: Box<dyn Sensor>,
        cluster: Arc<Cluster>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Arc::new(SensorContainer {
            key: key.into(),
            sensor: Arc::from(sensor),
            cluster,
            metrics,
            last_success: AtomicBool::new(true),
            last_error: Mutex::new(None),
            last_finished_at: Mutex::new(None),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            task: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sensor_name(&self) -> String {
        self.sensor.name()
    }

    pub fn interval(&self) -> Duration {
        self.sensor.interval()
    }

    pub fn last_success(&self) -> bool {
        self.last_success.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn last_finished_at(&self) -> Option<DateTime<Utc>> {
        *self.last_finished_at.lock().unwrap()
    }

    /// Start the observe loop. The first run happens immediately.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let Some(rx) = self.trigger_rx.lock().unwrap().take() else {
            return;
        };
        let container = self.clone();
        *task = Some(tokio::spawn(container.run_loop(rx)));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Cancel the pending wait and run the sensor now. The returned handle
    /// resolves with the outcome of the forced run.
    pub fn trigger_now(&self) -> oneshot::Receiver<SensorRunOutcome> {
        let (tx, rx) = oneshot::channel();
        let _ = self.trigger_tx.send(tx);
        rx
    }

    async fn run_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<oneshot::Sender<SensorRunOutcome>>,
    ) {
        let mut waiters: Vec<oneshot::Sender<SensorRunOutcome>> = Vec::new();
        loop {
            // Requests that arrived while a previous run was in flight are
            // satisfied by the run that starts now.
            while let Ok(waiter) = rx.try_recv() {
                waiters.push(waiter);
            }

            let outcome = self.observe_once().await;
            for waiter in waiters.drain(..) {
                let _ = waiter.send(outcome.clone());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.sensor.interval()) => {}
                trigger = rx.recv() => match trigger {
                    Some(waiter) => waiters.push(waiter),
                    None => return,
                },
            }
        }
    }

    async fn observe_once(&self) -> SensorRunOutcome {
        let cx = SensorCx {
            cluster: &self.cluster,
            sensor_key: &self.key,
        };
        let outcome = match self.sensor.observe(&cx).await {
            Ok(()) => {
                self.last_success.store(true, Ordering::Release);
                *self.last_error.lock().unwrap() = None;
                Ok(())
            }
            Err(e) => {
                warn!(
                    cluster = self.cluster.id(),
                    sensor = self.key,
                    error = %e,
                    "sensor observe failed"
                );
                self.last_success.store(false, Ordering::Release);
                *self.last_error.lock().unwrap() = Some(e.to_string());
                incr(&self.metrics.sensor_failures);
                Err(e.to_string())
            }
        };
        *self.last_finished_at.lock().unwrap() = Some(Utc::now());
        incr(&self.metrics.sensor_runs);
        outcome
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
