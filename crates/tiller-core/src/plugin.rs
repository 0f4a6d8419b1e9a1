//! Plugin configuration records and the constructor registry.
//!
//! Every sensor, operator, action, and alert is described by a `PluginSpec`:
//! a config key, the plugin implementation it names, an enabled flag, and a
//! free-form configuration map. Cluster-specific records override global ones
//! field-by-field: the global record fills in whatever the override omits.
//!
//! Implementations are resolved through an explicit registry of constructor
//! functions. Every spec is checked against the registry when it is added, so
//! a typo'd plugin name fails at startup rather than at first use.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::action::ActionTask;
use crate::alert::{Alert, AlertLevel};
use crate::config::PluginsConfig;
use crate::error::{Result, TillerError};
use crate::operator::Operator;
use crate::sensor::Sensor;

/// Free-form per-plugin configuration.
pub type PluginSettings = HashMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// PluginSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Config key, unique per plugin family.
    pub key: String,
    /// Registered implementation name. Required on global records; cluster
    /// overrides inherit it and cannot change it.
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub configuration: Option<PluginSettings>,
    /// Alert plugins only: the severities this instance serves.
    #[serde(default)]
    pub levels: Option<Vec<AlertLevel>>,
}

impl PluginSpec {
    pub fn settings(&self) -> PluginSettings {
        self.configuration.clone().unwrap_or_default()
    }

    /// Fill this (cluster-level) record from its global base: the
    /// implementation is pinned by the base, configuration entries are
    /// base-then-override, and levels fall back to the base's.
    fn merge_base(&mut self, base: &PluginSpec) {
        if base.plugin.is_some() {
            self.plugin = base.plugin.clone();
        }
        self.configuration = match (self.configuration.take(), base.configuration.clone()) {
            (None, inherited) => inherited,
            (own @ Some(_), None) => own,
            (Some(own), Some(mut merged)) => {
                merged.extend(own);
                Some(merged)
            }
        };
        if self.levels.is_none() {
            self.levels = base.levels.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// PluginRegistry
// ---------------------------------------------------------------------------

pub type PluginBuilder<T> = Box<dyn Fn(&PluginSettings) -> Result<Box<T>> + Send + Sync>;

/// Constructor registry plus the layered (global / per-cluster) spec store
/// for one plugin family.
pub struct PluginRegistry<T: ?Sized> {
    what: &'static str,
    builders: HashMap<String, PluginBuilder<T>>,
    /// Global specs in declaration order; operator evaluation order follows
    /// this.
    global: Vec<PluginSpec>,
    per_cluster: HashMap<String, HashMap<String, PluginSpec>>,
}

impl<T: ?Sized> PluginRegistry<T> {
    pub fn new(what: &'static str) -> Self {
        PluginRegistry {
            what,
            builders: HashMap::new(),
            global: Vec::new(),
            per_cluster: HashMap::new(),
        }
    }

    /// Register a constructor under an implementation name.
    pub fn register<F>(&mut self, plugin: &str, builder: F)
    where
        F: Fn(&PluginSettings) -> Result<Box<T>> + Send + Sync + 'static,
    {
        self.builders.insert(plugin.to_string(), Box::new(builder));
    }

    /// Add a global spec. Rejects duplicate keys, a missing `plugin` field,
    /// and implementation names with no registered constructor.
    pub fn add_global(&mut self, spec: PluginSpec) -> Result<()> {
        if self.global.iter().any(|s| s.key == spec.key) {
            return Err(TillerError::DuplicatePlugin(spec.key, self.what));
        }
        let plugin = spec.plugin.as_deref().ok_or_else(|| {
            TillerError::MissingPluginField {
                what: self.what,
                key: spec.key.clone(),
            }
        })?;
        if !self.builders.contains_key(plugin) {
            return Err(TillerError::UnknownPlugin {
                what: self.what,
                key: spec.key.clone(),
                plugin: plugin.to_string(),
            });
        }
        self.global.push(spec);
        Ok(())
    }

    /// Add cluster-level overrides. Each must have a global base record.
    pub fn add_cluster_overrides(&mut self, cluster_id: &str, specs: &[PluginSpec]) -> Result<()> {
        for spec in specs {
            let base = self
                .global
                .iter()
                .find(|s| s.key == spec.key)
                .ok_or_else(|| TillerError::MissingBaseConfig {
                    what: self.what,
                    key: spec.key.clone(),
                })?;
            let mut merged = spec.clone();
            merged.merge_base(base);
            self.per_cluster
                .entry(cluster_id.to_string())
                .or_default()
                .insert(merged.key.clone(), merged);
        }
        Ok(())
    }

    /// The effective spec for `key` on `cluster_id` (override, else global).
    pub fn spec_for(&self, cluster_id: &str, key: &str) -> Option<PluginSpec> {
        if let Some(overrides) = self.per_cluster.get(cluster_id) {
            if let Some(spec) = overrides.get(key) {
                return Some(spec.clone());
            }
        }
        self.global.iter().find(|s| s.key == key).cloned()
    }

    pub fn is_enabled(&self, cluster_id: &str, key: &str) -> bool {
        self.spec_for(cluster_id, key).is_some_and(|s| s.enabled)
    }

    pub fn settings_for(&self, cluster_id: &str, key: &str) -> PluginSettings {
        self.spec_for(cluster_id, key)
            .map(|s| s.settings())
            .unwrap_or_default()
    }

    /// Reverse lookup: the config key a registered implementation name is
    /// bound to globally. Used by action admission, where only the
    /// implementation is known.
    pub fn key_for_plugin(&self, plugin: &str) -> Option<String> {
        self.global
            .iter()
            .find(|s| s.plugin.as_deref() == Some(plugin))
            .map(|s| s.key.clone())
    }

    /// Effective specs for a cluster that are enabled, in global declaration
    /// order.
    pub fn enabled_specs(&self, cluster_id: &str) -> Vec<PluginSpec> {
        self.global
            .iter()
            .map(|g| {
                self.per_cluster
                    .get(cluster_id)
                    .and_then(|m| m.get(&g.key))
                    .cloned()
                    .unwrap_or_else(|| g.clone())
            })
            .filter(|s| s.enabled)
            .collect()
    }

    /// Build a fresh instance of the plugin configured under `key`.
    pub fn build(&self, cluster_id: &str, key: &str) -> Result<Box<T>> {
        let spec = self.spec_for(cluster_id, key).ok_or_else(|| {
            TillerError::UnknownPlugin {
                what: self.what,
                key: key.to_string(),
                plugin: "<unconfigured>".to_string(),
            }
        })?;
        if !spec.enabled {
            return Err(TillerError::Plugin(format!(
                "{} plugin '{key}' is disabled on cluster {cluster_id}",
                self.what
            )));
        }
        let plugin = spec.plugin.as_deref().unwrap_or("<unconfigured>");
        let builder = self
            .builders
            .get(plugin)
            .ok_or_else(|| TillerError::UnknownPlugin {
                what: self.what,
                key: key.to_string(),
                plugin: plugin.to_string(),
            })?;
        builder(&spec.settings())
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// The four plugin families, bundled for threading through the engines.
pub struct Registries {
    pub sensors: PluginRegistry<dyn Sensor>,
    pub operators: PluginRegistry<dyn Operator>,
    pub actions: PluginRegistry<dyn ActionTask>,
    pub alerts: PluginRegistry<dyn Alert>,
}

impl Registries {
    pub fn new() -> Self {
        Registries {
            sensors: PluginRegistry::new("sensor"),
            operators: PluginRegistry::new("operator"),
            actions: PluginRegistry::new("action"),
            alerts: PluginRegistry::new("alert"),
        }
    }

    pub fn apply_global(&mut self, plugins: &PluginsConfig) -> Result<()> {
        for spec in &plugins.sensors {
            self.sensors.add_global(spec.clone())?;
        }
        for spec in &plugins.operators {
            self.operators.add_global(spec.clone())?;
        }
        for spec in &plugins.actions {
            self.actions.add_global(spec.clone())?;
        }
        for spec in &plugins.alerts {
            self.alerts.add_global(spec.clone())?;
        }
        Ok(())
    }

    pub fn apply_cluster_overrides(
        &mut self,
        cluster_id: &str,
        plugins: &PluginsConfig,
    ) -> Result<()> {
        self.sensors
            .add_cluster_overrides(cluster_id, &plugins.sensors)?;
        self.operators
            .add_cluster_overrides(cluster_id, &plugins.operators)?;
        self.actions
            .add_cluster_overrides(cluster_id, &plugins.actions)?;
        self.alerts
            .add_cluster_overrides(cluster_id, &plugins.alerts)?;
        Ok(())
    }

    /// Fresh instances of every enabled alert plugin serving `level` on the
    /// cluster, with their config keys.
    pub fn alerts_for_level(
        &self,
        cluster_id: &str,
        level: AlertLevel,
    ) -> Result<Vec<(String, Box<dyn Alert>)>> {
        let mut out = Vec::new();
        for spec in self.alerts.enabled_specs(cluster_id) {
            let serves = spec.levels.as_ref().is_some_and(|ls| ls.contains(&level));
            if !serves {
                continue;
            }
            out.push((spec.key.clone(), self.alerts.build(cluster_id, &spec.key)?));
        }
        Ok(out)
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
