//! Per-backend configuration with accelerated-profile overrides.

use std::collections::HashMap;

use serde_json::Value;

/// A flat key/value configuration for one backend.
///
/// Any key may carry an accelerated sibling named `accel` + the key with
/// its first letter upcased (`timeout` / `accelTimeout`). While the
/// backend's accelerated flag is set, [`BackendConfig::get`] consults the
/// sibling first and falls back to the base key when no sibling exists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendConfig {
    values: HashMap<String, Value>,
}

impl BackendConfig {
    /// An empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Merge `other` into this configuration. Keys present in both take
    /// the incoming value; keys absent from `other` are left untouched.
    pub fn merge(&mut self, other: BackendConfig) {
        self.values.extend(other.values);
    }

    /// Look a key up, honoring the accelerated override when asked to.
    #[must_use]
    pub fn get(&self, key: &str, accelerated: bool) -> Option<&Value> {
        if accelerated {
            if let Some(value) = self.values.get(&accel_key(key)) {
                return Some(value);
            }
        }
        self.values.get(key)
    }

    /// [`BackendConfig::get`] narrowed to an unsigned integer.
    #[must_use]
    pub fn get_u64(&self, key: &str, accelerated: bool) -> Option<u64> {
        self.get(key, accelerated).and_then(Value::as_u64)
    }

    /// Number of keys present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no keys are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, Value)> for BackendConfig {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// The accelerated sibling of `key`: `timeout` becomes `accelTimeout`.
fn accel_key(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => format!("accel{}{}", first.to_uppercase(), chars.as_str()),
        None => "accel".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accel_key_upcases_first_letter() {
        assert_eq!(accel_key("timeout"), "accelTimeout");
        assert_eq!(accel_key("reconnectDelay"), "accelReconnectDelay");
    }

    #[test]
    fn accelerated_lookup_prefers_override() {
        let mut config = BackendConfig::new();
        config.set("timeout", 10);
        config.set("accelTimeout", 1);

        assert_eq!(config.get_u64("timeout", false), Some(10));
        assert_eq!(config.get_u64("timeout", true), Some(1));
    }

    #[test]
    fn accelerated_lookup_falls_back_without_override() {
        let mut config = BackendConfig::new();
        config.set("timeout", 10);

        assert_eq!(config.get_u64("timeout", true), Some(10));
        assert_eq!(config.get("missing", true), None);
    }

    #[test]
    fn merge_overwrites_and_keeps() {
        let mut base = BackendConfig::new();
        base.set("timeout", 10);
        base.set("host", "localhost");

        let incoming: BackendConfig =
            [("timeout".to_owned(), json!(25))].into_iter().collect();
        base.merge(incoming);

        assert_eq!(base.get_u64("timeout", false), Some(25));
        assert_eq!(base.get("host", false), Some(&json!("localhost")));
    }
}
