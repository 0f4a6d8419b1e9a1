//! The per-cluster (and per-node) attribute store.
//!
//! Sensors publish derived facts here; operators read them to decide what to
//! do. Every entry remembers which sensors publish it so that an action which
//! consumed the entry can force those sensors to re-run once it completes.
//! There is no removal API; stale values are simply overwritten.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Attribute
// ---------------------------------------------------------------------------

/// A single stored value plus its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    pub value: Value,
    /// Keys of the sensors that publish this attribute. Empty for values
    /// written outside the sensor path (e.g. bootstrap configuration).
    #[serde(skip)]
    pub publishing_sensors: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
    /// Hidden attributes are readable by key but excluded from `visible()`.
    #[serde(skip)]
    pub hidden: bool,
}

impl Attribute {
    /// Deserialize the value into a concrete type.
    pub fn value_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

// ---------------------------------------------------------------------------
// AttributeBag
// ---------------------------------------------------------------------------

/// Concurrent attribute map. Writes are per-key last-write-wins; there are no
/// cross-key transactions. Readers (API surfaces, operators) always see a
/// consistent single entry.
#[derive(Debug, Default)]
pub struct AttributeBag {
    inner: RwLock<HashMap<String, Attribute>>,
}

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Attribute> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().unwrap().contains_key(key)
    }

    /// Write `value` under `key`, attributed to the sensor `writer`.
    pub fn set(&self, key: &str, value: Value, writer: &str) {
        self.put(key, value, BTreeSet::from([writer.to_string()]), false);
    }

    /// Write a value with no publishing sensor (bootstrap/config writes).
    pub fn set_unattributed(&self, key: &str, value: Value) {
        self.put(key, value, BTreeSet::new(), false);
    }

    /// Like `set`, but the entry is excluded from `visible()`.
    pub fn set_hidden(&self, key: &str, value: Value, writer: &str) {
        self.put(key, value, BTreeSet::from([writer.to_string()]), true);
    }

    /// Insert a pre-built attribute verbatim (used when copying between
    /// stores, preserving provenance).
    pub fn insert(&self, key: &str, attribute: Attribute) {
        self.inner
            .write()
            .unwrap()
            .insert(key.to_string(), attribute);
    }

    fn put(&self, key: &str, value: Value, publishing_sensors: BTreeSet<String>, hidden: bool) {
        self.inner.write().unwrap().insert(
            key.to_string(),
            Attribute {
                value,
                publishing_sensors,
                updated_at: Utc::now(),
                hidden,
            },
        );
    }

    /// Snapshot of the non-hidden entries, sorted by key.
    pub fn visible(&self) -> BTreeMap<String, Attribute> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .filter(|(_, a)| !a.hidden)
            .map(|(k, a)| (k.clone(), a.clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().unwrap().keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_records_publishing_sensor() {
        let bag = AttributeBag::new();
        bag.set("broker.count", json!(12), "topology");
        let attr = bag.get("broker.count").unwrap();
        assert_eq!(attr.value, json!(12));
        assert!(attr.publishing_sensors.contains("topology"));
        assert!(!attr.hidden);
    }

    #[test]
    fn overwrite_is_last_write_wins() {
        let bag = AttributeBag::new();
        bag.set("k", json!(1), "s1");
        bag.set("k", json!(2), "s2");
        let attr = bag.get("k").unwrap();
        assert_eq!(attr.value, json!(2));
        assert_eq!(
            attr.publishing_sensors,
            BTreeSet::from(["s2".to_string()])
        );
    }

    #[test]
    fn hidden_entries_are_readable_but_not_visible() {
        let bag = AttributeBag::new();
        bag.set("shown", json!("a"), "s");
        bag.set_hidden("secret", json!("b"), "s");
        assert!(bag.get("secret").is_some());
        let visible = bag.visible();
        assert!(visible.contains_key("shown"));
        assert!(!visible.contains_key("secret"));
    }

    #[test]
    fn value_as_deserializes() {
        let bag = AttributeBag::new();
        bag.set("n", json!(7), "s");
        let n: u64 = bag.get("n").unwrap().value_as().unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn missing_key_is_none() {
        let bag = AttributeBag::new();
        assert!(bag.get("nope").is_none());
        assert!(!bag.contains("nope"));
    }
}
