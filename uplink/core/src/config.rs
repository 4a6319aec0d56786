//! Manager configuration, loadable from TOML or the environment.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tunables for the arbitration manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Delay before the self-heal reconnect once every backend is down,
    /// in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Failed attempts per backend before its kind's escalation policy
    /// kicks in.
    pub retry_ceiling: u32,
    /// Whether the privileged helper component is supported in this
    /// environment at all.
    pub privileged_supported: bool,
    /// Legacy host environment: the socket backend is never reinstated
    /// and an active privileged backend cannot be refreshed in place.
    pub legacy_environment: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1000,
            retry_ceiling: 2,
            privileged_supported: true,
            legacy_environment: false,
        }
    }
}

impl ManagerConfig {
    /// Defaults overridden by `UPLINK_*` environment variables where set:
    /// `UPLINK_RECONNECT_DELAY_MS`, `UPLINK_RETRY_CEILING`,
    /// `UPLINK_PRIVILEGED_SUPPORTED`, `UPLINK_LEGACY_ENVIRONMENT`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(delay) = env_parse("UPLINK_RECONNECT_DELAY_MS") {
            config.reconnect_delay_ms = delay;
        }
        if let Some(ceiling) = env_parse("UPLINK_RETRY_CEILING") {
            config.retry_ceiling = ceiling;
        }
        if let Some(supported) = env_flag("UPLINK_PRIVILEGED_SUPPORTED") {
            config.privileged_supported = supported;
        }
        if let Some(legacy) = env_flag("UPLINK_LEGACY_ENVIRONMENT") {
            config.legacy_environment = legacy;
        }
        config
    }

    /// Load from a TOML file. Missing keys fall back to the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// The self-heal delay as a [`Duration`].
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.reconnect_delay_ms, 1000);
        assert_eq!(config.retry_ceiling, 2);
        assert!(config.privileged_supported);
        assert!(!config.legacy_environment);
    }

    #[test]
    fn load_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retry_ceiling = 5").unwrap();
        writeln!(file, "legacy_environment = true").unwrap();

        let config = ManagerConfig::load(file.path()).unwrap();
        assert_eq!(config.retry_ceiling, 5);
        assert!(config.legacy_environment);
        assert_eq!(config.reconnect_delay_ms, 1000);
        assert!(config.privileged_supported);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(ManagerConfig::load(Path::new("/nonexistent/uplink.toml")).is_err());
    }

    #[test]
    fn from_env_overrides_defaults_and_rejects_garbage() {
        std::env::set_var("UPLINK_RETRY_CEILING", "7");
        std::env::set_var("UPLINK_LEGACY_ENVIRONMENT", "yes");
        std::env::set_var("UPLINK_RECONNECT_DELAY_MS", "soon");
        std::env::set_var("UPLINK_PRIVILEGED_SUPPORTED", "maybe");

        let config = ManagerConfig::from_env();

        std::env::remove_var("UPLINK_RETRY_CEILING");
        std::env::remove_var("UPLINK_LEGACY_ENVIRONMENT");
        std::env::remove_var("UPLINK_RECONNECT_DELAY_MS");
        std::env::remove_var("UPLINK_PRIVILEGED_SUPPORTED");

        assert_eq!(config.retry_ceiling, 7);
        assert!(config.legacy_environment);
        // malformed values fall back to the defaults
        assert_eq!(config.reconnect_delay_ms, 1000);
        assert!(config.privileged_supported);
    }
}
