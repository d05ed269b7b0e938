//! Run configuration.
//!
//! A [`RunConfig`] is built once before a soak run starts and is never
//! mutated afterwards. Controller parameters are carried opaquely as a JSON
//! object; the only thing this crate does with them is apply the standard
//! soak overrides before handing them to the controller factory.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Which action follows every tunnel establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    /// Drop the active tunnel and let the controller re-establish.
    ReconnectTunnel,
    /// Stop the controller and start a fresh one.
    RestartController,
    /// Coin flip between the two on every establishment.
    ReconnectAndRestart,
}

impl TestMode {
    /// All modes, in declaration order.
    pub const ALL: [TestMode; 3] = [
        TestMode::ReconnectTunnel,
        TestMode::RestartController,
        TestMode::ReconnectAndRestart,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::ReconnectTunnel => "reconnect_tunnel",
            TestMode::RestartController => "restart_controller",
            TestMode::ReconnectAndRestart => "reconnect_and_restart",
        }
    }

    /// Parse from string. Accepts the short CLI spellings as well.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "reconnect_tunnel" | "reconnect" => Some(TestMode::ReconnectTunnel),
            "restart_controller" | "restart" => Some(TestMode::RestartController),
            "reconnect_and_restart" | "both" => Some(TestMode::ReconnectAndRestart),
            _ => None,
        }
    }

    /// One-line description for listings.
    pub fn description(&self) -> &'static str {
        match self {
            TestMode::ReconnectTunnel => "terminate the active tunnel after each establishment",
            TestMode::RestartController => "stop and restart the controller after each establishment",
            TestMode::ReconnectAndRestart => "randomly reconnect or restart after each establishment",
        }
    }
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque controller parameters.
///
/// `config` is the controller's own configuration object; `parameters` are
/// client parameter overrides applied on top of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerParams {
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ControllerParams {
    /// Parse a controller configuration document. It must be a JSON object.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(config) => Ok(Self {
                config,
                parameters: Map::new(),
            }),
            other => Err(Error::invalid_config(format!(
                "controller config must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Apply the overrides every soak run needs: a single tunnel, fast
    /// retries, no local proxies, diagnostics on, and all on-disk state
    /// under `data_dir`.
    pub fn apply_soak_overrides(&mut self, data_dir: &Path) {
        let dir = |name: &str| Value::from(data_dir.join(name).to_string_lossy().into_owned());

        let overrides = [
            ("ClientVersion", Value::from("999999999")),
            ("TunnelPoolSize", Value::from(1)),
            ("DataStoreDirectory", Value::from(data_dir.to_string_lossy().into_owned())),
            ("RemoteServerListDownloadFilename", dir("server_list_compressed")),
            ("UpgradeDownloadFilename", dir("upgrade")),
            ("FetchRemoteServerListRetryPeriodMilliseconds", Value::from(250)),
            ("EstablishTunnelPausePeriodSeconds", Value::from(1)),
            ("ConnectionWorkerPoolSize", Value::from(10)),
            ("DisableLocalSocksProxy", Value::from(true)),
            ("DisableLocalHTTPProxy", Value::from(true)),
            ("LimitIntensiveConnectionWorkers", Value::from(5)),
            ("LimitMeekBufferSizes", Value::from(true)),
            ("StaggerConnectionWorkersMilliseconds", Value::from(100)),
            ("IgnoreHandshakeStatsRegexps", Value::from(true)),
            ("EmitDiagnosticNotices", Value::from(true)),
        ];
        for (key, value) in overrides {
            self.config.insert(key.to_string(), value);
        }

        // Don't wait for a tactics request.
        self.parameters
            .insert("TacticsWaitPeriod".to_string(), Value::from("1ms"));
    }

    /// Look up a config value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Configuration for a single soak run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Test mode
    #[serde(default = "default_mode")]
    pub mode: TestMode,

    /// Total run duration in seconds
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Memory inspection interval in seconds
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,

    /// Delay between an establishment notice and the follow-up action, in ms
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Maximum allowed system memory in bytes
    #[serde(default = "default_max_sys_memory")]
    pub max_sys_memory: u64,

    /// Parameters handed to the controller factory
    #[serde(default)]
    pub controller: ControllerParams,
}

fn default_mode() -> TestMode {
    TestMode::ReconnectTunnel
}

fn default_duration_secs() -> u64 {
    120 // 2 minutes
}

fn default_sample_interval_secs() -> u64 {
    10
}

fn default_settle_delay_ms() -> u64 {
    250
}

fn default_max_sys_memory() -> u64 {
    11 * 1024 * 1024
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            duration_secs: default_duration_secs(),
            sample_interval_secs: default_sample_interval_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            max_sys_memory: default_max_sys_memory(),
            controller: ControllerParams::default(),
        }
    }
}

impl RunConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.duration_secs == 0 {
            return Err(Error::invalid_config("duration_secs must be greater than zero"));
        }
        if self.sample_interval_secs == 0 {
            return Err(Error::invalid_config(
                "sample_interval_secs must be greater than zero",
            ));
        }
        if self.max_sys_memory == 0 {
            return Err(Error::invalid_config("max_sys_memory must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_run_config() {
        let config = RunConfig::default();

        assert_eq!(config.mode, TestMode::ReconnectTunnel);
        assert_eq!(config.duration(), Duration::from_secs(120));
        assert_eq!(config.sample_interval(), Duration::from_secs(10));
        assert_eq!(config.settle_delay(), Duration::from_millis(250));
        assert_eq!(config.max_sys_memory, 11 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = RunConfig::default();
        config.sample_interval_secs = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = RunConfig::default();
        config.duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.max_sys_memory = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(TestMode::parse("reconnect"), Some(TestMode::ReconnectTunnel));
        assert_eq!(TestMode::parse("RESTART"), Some(TestMode::RestartController));
        assert_eq!(
            TestMode::parse("reconnect-and-restart"),
            Some(TestMode::ReconnectAndRestart)
        );
        assert_eq!(TestMode::parse("both"), Some(TestMode::ReconnectAndRestart));
        assert_eq!(TestMode::parse("sideways"), None);

        for mode in TestMode::ALL {
            assert_eq!(TestMode::parse(mode.as_str()), Some(mode));
        }
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"mode": "restart_controller", "duration_secs": 30}"#)
                .unwrap();

        assert_eq!(config.mode, TestMode::RestartController);
        assert_eq!(config.duration_secs, 30);
        assert_eq!(config.sample_interval_secs, 10);
        assert!(config.controller.config.is_empty());
    }

    #[test]
    fn test_controller_params_must_be_object() {
        let err = ControllerParams::from_json_slice(b"[1, 2]").unwrap_err();
        assert!(err.to_string().contains("an array"));

        assert!(ControllerParams::from_json_slice(b"not json").is_err());
    }

    #[test]
    fn test_soak_overrides_replace_user_values() {
        let temp = tempdir().unwrap();
        let mut params = ControllerParams::from_json_slice(
            br#"{"TunnelPoolSize": 4, "PropagationChannelId": "abc"}"#,
        )
        .unwrap();

        params.apply_soak_overrides(temp.path());

        assert_eq!(params.get("TunnelPoolSize"), Some(&Value::from(1)));
        assert_eq!(params.get("PropagationChannelId"), Some(&Value::from("abc")));
        assert_eq!(
            params.get("DataStoreDirectory").and_then(Value::as_str),
            temp.path().to_str()
        );
        let upgrade = params
            .get("UpgradeDownloadFilename")
            .and_then(Value::as_str)
            .unwrap();
        assert!(upgrade.ends_with("upgrade"));
        assert_eq!(
            params.parameters.get("TacticsWaitPeriod"),
            Some(&Value::from("1ms"))
        );
    }
}
