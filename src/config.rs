//! Configuration loading

use crate::client::ClientOptions;
use crate::connection::{ConnectionOptions, RetryPolicy};
use crate::error::{Error, Result};
use crate::gate::GateConfig;
use crate::poller::PollSchedule;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub change_gate: ChangeGateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Advertised name or address of the station
    #[serde(default)]
    pub target: Option<String>,
    /// Bound on each connect call
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Stop scanning once no advertisement has arrived for this long
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            target: None,
            connect_timeout_secs: default_connect_timeout(),
            scan_timeout_secs: default_scan_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_scan_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,
    #[serde(default = "default_settings_interval")]
    pub settings_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_secs: default_telemetry_interval(),
            settings_interval_secs: default_settings_interval(),
        }
    }
}

fn default_telemetry_interval() -> u64 {
    30
}

fn default_settings_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay after the first failed attempt
    #[serde(default = "default_retry_base")]
    pub base_secs: u64,
    #[serde(default = "default_max_doublings")]
    pub max_doublings: u32,
    /// Give up after this many consecutive failures, 0 = never give up
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: default_retry_base(),
            max_doublings: default_max_doublings(),
            max_failures: default_max_failures(),
        }
    }
}

fn default_retry_base() -> u64 {
    60
}

fn default_max_doublings() -> u32 {
    2
}

fn default_max_failures() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeGateConfig {
    /// Power swings up to this many watts are not worth a refresh
    #[serde(default = "default_power_threshold")]
    pub power_threshold_w: u16,
    /// Refresh at least this often
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,
}

impl Default for ChangeGateConfig {
    fn default() -> Self {
        Self {
            power_threshold_w: default_power_threshold(),
            staleness_secs: default_staleness(),
        }
    }
}

fn default_power_threshold() -> u16 {
    3
}

fn default_staleness() -> u64 {
    30
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry.base_secs),
            max_doublings: self.retry.max_doublings,
            max_failures: (self.retry.max_failures > 0).then_some(self.retry.max_failures),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connection: ConnectionOptions {
                connect_timeout: Duration::from_secs(self.device.connect_timeout_secs),
                retry: self.retry_policy(),
                ..ConnectionOptions::default()
            },
            polling: PollSchedule {
                telemetry_interval: Duration::from_secs(self.polling.telemetry_interval_secs),
                settings_interval: Duration::from_secs(self.polling.settings_interval_secs),
            },
            gate: GateConfig {
                power_threshold_w: self.change_gate.power_threshold_w,
                staleness: Duration::from_secs(self.change_gate.staleness_secs),
            },
        }
    }
}

/// Load configuration from `path`, falling back to defaults when it does not exist
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        let config = Config::parse(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.device.target, None);
    assert_eq!(config.device.scan_timeout_secs, 5);
    let options = config.client_options();
    assert_eq!(options.connection.connect_timeout, Duration::from_secs(10));
    assert_eq!(options.connection.retry, RetryPolicy::default());
    assert_eq!(options.polling, PollSchedule::default());
    assert_eq!(options.gate, GateConfig::default());
}

#[test]
fn test_full_config() {
    let config = Config::parse(
        r#"
        [device]
        target = "FOSSIBOT-F2400"
        connect_timeout_secs = 5

        [polling]
        telemetry_interval_secs = 10

        [retry]
        base_secs = 15
        max_failures = 0

        [change_gate]
        power_threshold_w = 5
        staleness_secs = 120
        "#,
    )
    .unwrap();

    assert_eq!(config.device.target.as_deref(), Some("FOSSIBOT-F2400"));
    let options = config.client_options();
    assert_eq!(options.connection.connect_timeout, Duration::from_secs(5));
    assert_eq!(options.polling.telemetry_interval, Duration::from_secs(10));
    assert_eq!(options.polling.settings_interval, Duration::from_secs(60));
    assert_eq!(options.connection.retry.base, Duration::from_secs(15));
    assert_eq!(options.connection.retry.max_doublings, 2);
    assert_eq!(options.connection.retry.max_failures, None);
    assert_eq!(options.gate.power_threshold_w, 5);
    assert_eq!(options.gate.staleness, Duration::from_secs(120));
}

#[test]
fn test_invalid_config() {
    let result = Config::parse("[retry]\nbase_secs = \"soon\"");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_missing_file_gives_defaults() {
    let config = load_config(Path::new("/nonexistent/powerstation.toml")).unwrap();
    assert_eq!(config.retry.max_failures, 5);
}
