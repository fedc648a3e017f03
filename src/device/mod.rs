//! Shared device configuration.
//!
//! The configuration is a hierarchical tree addressed by dotted keys
//! (`Q1.setting.LO`). Updates either write through to the base tree or stay
//! in a local cache overlay; every touched key remembers its pre-update value
//! until the buffer is cleared. Tasks never read the live tree: they compile
//! against an immutable [`ConfigSnapshot`] taken when they are submitted.

mod tree;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::error::CompileError;

/// Immutable copy of the device configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSnapshot(Value);

impl ConfigSnapshot {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn query(&self, key: &str) -> Option<&Value> {
        tree::extract_path(&self.0, key)
    }

    /// Like [`query`](Self::query) but fails the compilation when absent.
    pub fn require(&self, key: &str) -> Result<&Value, CompileError> {
        self.query(key).ok_or_else(|| CompileError::missing(key))
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, CompileError> {
        self.require(key)?
            .as_f64()
            .ok_or_else(|| CompileError::invalid(key, "expected a number"))
    }

    pub fn require_str(&self, key: &str) -> Result<&str, CompileError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| CompileError::invalid(key, "expected a string"))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

#[derive(Debug)]
struct DeviceState {
    base: Value,
    overlay: Value,
    history: BTreeMap<String, Option<Value>>,
}

impl DeviceState {
    fn query(&self, key: &str) -> Option<Value> {
        let base = tree::extract_path(&self.base, key).cloned();
        let cached = tree::extract_path(&self.overlay, key).cloned();
        match (base, cached) {
            (Some(base), Some(cached)) => Some(tree::merge_values(base, cached)),
            (base, cached) => cached.or(base),
        }
    }
}

/// Live configuration shared between the scheduler and its callers.
#[derive(Debug)]
pub struct DeviceConfig {
    state: Mutex<DeviceState>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl DeviceConfig {
    pub fn new(initial: Value) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                base: initial,
                overlay: Value::Object(Map::new()),
                history: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn query(&self, key: &str) -> Option<Value> {
        self.lock().query(key)
    }

    /// Set `key` to `value`.
    ///
    /// With `cache` the value lives only in the local overlay until
    /// [`commit`](Self::commit); otherwise it is written through.
    pub fn update(&self, key: &str, value: Value, cache: bool) {
        let mut state = self.lock();
        if !state.history.contains_key(key) {
            let previous = state.query(key);
            state.history.insert(key.to_string(), previous);
        }
        if !cache {
            tree::set_path(&mut state.base, key, value.clone());
        }
        tree::set_path(&mut state.overlay, key, value);
    }

    pub fn update_all(&self, values: impl IntoIterator<Item = (String, Value)>, cache: bool) {
        for (key, value) in values {
            self.update(&key, value, cache);
        }
    }

    /// Leaf keys below `prefix` (all keys for an empty prefix).
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let state = self.lock();
        let mut out = Vec::new();
        if let Some(subtree) = state.query(prefix) {
            tree::leaf_keys(&subtree, prefix, &mut out);
        }
        out
    }

    pub fn export(&self) -> ConfigSnapshot {
        let state = self.lock();
        ConfigSnapshot(tree::merge_values(
            state.base.clone(),
            state.overlay.clone(),
        ))
    }

    /// Pre-update values of every key touched since the last clear.
    pub fn history(&self) -> BTreeMap<String, Option<Value>> {
        self.lock().history.clone()
    }

    /// Drop cached values and history.
    pub fn clear_buffer(&self) {
        let mut state = self.lock();
        state.overlay = Value::Object(Map::new());
        state.history.clear();
    }

    /// Write cached values through to the base tree.
    pub fn commit(&self) {
        let mut state = self.lock();
        let overlay = std::mem::replace(&mut state.overlay, Value::Object(Map::new()));
        let base = std::mem::take(&mut state.base);
        state.base = tree::merge_values(base, overlay);
        state.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> DeviceConfig {
        DeviceConfig::new(json!({
            "Q1": {"setting": {"LO": 4.35e9, "POW": 21}, "channel": {"I": "AWG1.CH1"}},
        }))
    }

    #[test]
    fn test_query_nested() {
        let cfg = config();
        assert_eq!(cfg.query("Q1.setting.LO"), Some(json!(4.35e9)));
        assert_eq!(cfg.query("Q1.channel"), Some(json!({"I": "AWG1.CH1"})));
        assert_eq!(cfg.query("Q2"), None);
    }

    #[test]
    fn test_cached_update_is_visible_but_not_written_through() {
        let cfg = config();
        cfg.update("Q1.setting.LO", json!(4.4e9), true);
        assert_eq!(cfg.query("Q1.setting.LO"), Some(json!(4.4e9)));
        assert_eq!(cfg.query("Q1.setting.POW"), Some(json!(21)));

        cfg.clear_buffer();
        assert_eq!(cfg.query("Q1.setting.LO"), Some(json!(4.35e9)));
    }

    #[test]
    fn test_write_through_survives_clear() {
        let cfg = config();
        cfg.update("Q1.setting.POW", json!(18), false);
        cfg.clear_buffer();
        assert_eq!(cfg.query("Q1.setting.POW"), Some(json!(18)));
    }

    #[test]
    fn test_history_records_first_previous_value() {
        let cfg = config();
        cfg.update("Q1.setting.POW", json!(18), true);
        cfg.update("Q1.setting.POW", json!(15), true);
        cfg.update("Q1.setting.NEW", json!(1), true);

        let history = cfg.history();
        assert_eq!(history.get("Q1.setting.POW"), Some(&Some(json!(21))));
        assert_eq!(history.get("Q1.setting.NEW"), Some(&None));
    }

    #[test]
    fn test_commit_flushes_cache() {
        let cfg = config();
        cfg.update("Q1.setting.LO", json!(5e9), true);
        cfg.commit();
        cfg.clear_buffer();
        assert_eq!(cfg.query("Q1.setting.LO"), Some(json!(5e9)));
        assert!(cfg.history().is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_edits() {
        let cfg = config();
        let snapshot = cfg.export();
        cfg.update("Q1.setting.LO", json!(1.0), false);

        assert_eq!(snapshot.query("Q1.setting.LO"), Some(&json!(4.35e9)));
        assert_eq!(snapshot.require_f64("Q1.setting.LO").unwrap(), 4.35e9);
        assert!(matches!(
            snapshot.require("Q1.setting.XY"),
            Err(CompileError::MissingConfig { .. })
        ));
        assert!(snapshot.require_f64("Q1.channel.I").is_err());
    }

    #[test]
    fn test_keys() {
        let cfg = config();
        assert_eq!(cfg.keys("Q1.setting"), vec!["Q1.setting.LO", "Q1.setting.POW"]);
        assert_eq!(cfg.keys("").len(), 3);
    }
}
