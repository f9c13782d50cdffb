//! Configuration loading for devhost.
//!
//! TOML file + `DEVHOST_` environment overrides merged with figment, and
//! translation into `devhost_core` runtime types: [`DaemonConfig`],
//! [`BackoffRetryPolicy`] and per-host [`ConfigurationSnapshot`]s.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
    value::{Tag, Value},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use devhost_core::{
    BackoffConfig, BackoffRetryPolicy, ConfigurationSnapshot, DEFAULT_BACKOFF_MS, DaemonConfig,
    DeviceConfiguration, ExhaustedBehavior, StopBehavior,
};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("host '{host}' is not defined in the configuration")]
    UnknownHost { host: String, available: Vec<String> },

    #[error("invalid configuration for device '{host}.{device}': {reason}")]
    Device {
        host: String,
        device: String,
        reason: String,
    },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub logging: LoggingSection,

    /// Named device hosts.
    #[serde(default)]
    pub hosts: BTreeMap<String, HostSection>,
}

/// `[daemon]`: supervision of AlwaysRunning devices.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonSection {
    /// Restart delays in milliseconds, indexed by consecutive failures.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,

    #[serde(default)]
    pub on_exhausted: ExhaustedBehavior,

    #[serde(default = "default_policy_failure_delay_ms")]
    pub policy_failure_delay_ms: u64,

    #[serde(default)]
    pub stop_behavior: StopBehavior,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            on_exhausted: ExhaustedBehavior::default(),
            policy_failure_delay_ms: default_policy_failure_delay_ms(),
            stop_behavior: StopBehavior::default(),
        }
    }
}

fn default_backoff_ms() -> Vec<u64> {
    DEFAULT_BACKOFF_MS.to_vec()
}
fn default_policy_failure_delay_ms() -> u64 {
    1000
}

/// `[logging]`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_level() -> String {
    "info".into()
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// `[hosts.<name>]`: one device host and its devices.
///
/// Device tables stay untyped until [`snapshot`](Self::snapshot) is asked
/// for a concrete configuration type.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostSection {
    /// Apply only the listed devices; leave the others alone.
    #[serde(default)]
    pub partial: bool,

    /// Accept a host with no devices (clears it on a full apply).
    #[serde(default)]
    pub allow_empty: bool,

    /// Key presented when reconfiguring key-protected devices.
    #[serde(default)]
    pub controller_key: Option<String>,

    /// Device tables keyed by device name.
    #[serde(default)]
    pub devices: BTreeMap<String, Value>,
}

impl HostSection {
    /// Deserialize every device table into `C`, injecting the table key as
    /// the device `name`.
    pub fn snapshot<C>(&self, host: &str) -> Result<ConfigurationSnapshot<C>, ConfigError>
    where
        C: DeviceConfiguration + DeserializeOwned,
    {
        let mut items = Vec::with_capacity(self.devices.len());
        for (device, value) in &self.devices {
            let device_error = |reason: String| ConfigError::Device {
                host: host.to_owned(),
                device: device.clone(),
                reason,
            };

            let Value::Dict(tag, table) = value else {
                return Err(device_error("expected a table".into()));
            };
            let mut table = table.clone();
            if let Some(name) = table.get("name").and_then(Value::as_str) {
                if name != device {
                    return Err(device_error(format!(
                        "name '{name}' does not match its table key"
                    )));
                }
            }
            table.insert("name".into(), Value::String(Tag::Default, device.clone()));

            let config: C = Value::Dict(*tag, table)
                .deserialize()
                .map_err(|e| device_error(e.to_string()))?;
            items.push(config);
        }

        Ok(ConfigurationSnapshot {
            items,
            partial: self.partial,
            controller_key: self.controller_key.clone(),
        })
    }
}

// ── Validation / translation ────────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.backoff_ms.contains(&0) {
            return Err(ConfigError::Validation {
                field: "daemon.backoff_ms".into(),
                reason: "delays must be positive".into(),
            });
        }
        if self.daemon.policy_failure_delay_ms == 0 {
            return Err(ConfigError::Validation {
                field: "daemon.policy_failure_delay_ms".into(),
                reason: "must be positive".into(),
            });
        }
        for (name, host) in &self.hosts {
            if name.is_empty() || name.contains('.') {
                return Err(ConfigError::Validation {
                    field: "hosts".into(),
                    reason: format!("invalid host name '{name}'"),
                });
            }
            if host.devices.is_empty() && !host.allow_empty {
                return Err(ConfigError::Validation {
                    field: format!("hosts.{name}.devices"),
                    reason: "no devices configured (set allow_empty = true to permit)".into(),
                });
            }
        }
        Ok(())
    }

    pub fn host(&self, name: &str) -> Result<&HostSection, ConfigError> {
        self.hosts.get(name).ok_or_else(|| ConfigError::UnknownHost {
            host: name.to_owned(),
            available: self.hosts.keys().cloned().collect(),
        })
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            backoff: self.backoff_config(),
            policy_failure_delay: Duration::from_millis(self.daemon.policy_failure_delay_ms),
            stop_behavior: self.daemon.stop_behavior,
        }
    }

    pub fn retry_policy(&self) -> BackoffRetryPolicy {
        BackoffRetryPolicy::new(self.backoff_config())
    }

    fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            delays_ms: self.daemon.backoff_ms.clone(),
            on_exhausted: self.daemon.on_exhausted,
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the default config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("rs", "devhost", "devhost").map_or_else(
        || PathBuf::from("devhost.toml"),
        |dirs| dirs.config_dir().join("devhost.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DEVHOST_").split("__"))
}

/// Load and validate the configuration from `path` + environment.
///
/// Nested keys are overridden with a double underscore, e.g.
/// `DEVHOST_DAEMON__STOP_BEHAVIOR=stop_devices_and_wait`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

/// Parse a TOML document without consulting the environment.
pub fn parse_config(toml: &str) -> Result<Config, ConfigError> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::string(toml))
        .extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use devhost_core::{ConfigurationStatus, CoreError};
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GaugeConfiguration {
        name: String,
        #[serde(default)]
        status: ConfigurationStatus,
        #[serde(default)]
        interval_ms: u64,
    }

    impl DeviceConfiguration for GaugeConfiguration {
        fn kind(&self) -> &str {
            "test::GaugeConfiguration"
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn status(&self) -> ConfigurationStatus {
            self.status
        }

        fn validate(&self) -> Result<(), CoreError> {
            Ok(())
        }
    }

    const SAMPLE: &str = r#"
        [daemon]
        backoff_ms = [100, 200]
        on_exhausted = "retry_forever"
        stop_behavior = "stop_devices_and_wait"

        [logging]
        format = "json"

        [hosts.boiler]
        controller_key = "ops"

        [hosts.boiler.devices.inlet]
        status = "AlwaysRunning"
        interval_ms = 500

        [hosts.boiler.devices.outlet]
        interval_ms = 250
    "#;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("missing.toml")).unwrap();

        assert_eq!(config.daemon.backoff_ms, vec![250, 300, 500, 750]);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.hosts.is_empty());
        assert_eq!(config.daemon_config(), DaemonConfig::default());
    }

    #[test]
    fn loads_file_and_translates_daemon_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        let daemon = config.daemon_config();

        assert_eq!(daemon.backoff.delays_ms, vec![100, 200]);
        assert_eq!(daemon.backoff.on_exhausted, ExhaustedBehavior::RetryForever);
        assert_eq!(daemon.policy_failure_delay, Duration::from_secs(1));
        assert_eq!(daemon.stop_behavior, StopBehavior::StopDevicesAndWait);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.retry_policy().delay_for(7), Some(200));
    }

    #[test]
    fn snapshot_injects_device_names() {
        let config = parse_config(SAMPLE).unwrap();
        let snapshot = config
            .host("boiler")
            .unwrap()
            .snapshot::<GaugeConfiguration>("boiler")
            .unwrap();

        assert!(!snapshot.partial);
        assert_eq!(snapshot.controller_key.as_deref(), Some("ops"));
        assert_eq!(
            snapshot.items,
            vec![
                GaugeConfiguration {
                    name: "inlet".into(),
                    status: ConfigurationStatus::AlwaysRunning,
                    interval_ms: 500,
                },
                GaugeConfiguration {
                    name: "outlet".into(),
                    status: ConfigurationStatus::Runnable,
                    interval_ms: 250,
                },
            ]
        );
    }

    #[test]
    fn conflicting_device_name_is_rejected() {
        let config = parse_config(
            r#"
            [hosts.boiler.devices.inlet]
            name = "outlet"
            "#,
        )
        .unwrap();

        let err = config
            .host("boiler")
            .unwrap()
            .snapshot::<GaugeConfiguration>("boiler")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Device { ref device, .. } if device == "inlet"));
    }

    #[test]
    fn mistyped_device_field_names_the_device() {
        let config = parse_config(
            r#"
            [hosts.boiler.devices.inlet]
            interval_ms = "soon"
            "#,
        )
        .unwrap();

        let err = config
            .host("boiler")
            .unwrap()
            .snapshot::<GaugeConfiguration>("boiler")
            .unwrap_err();
        assert!(err.to_string().contains("boiler.inlet"));
    }

    #[test]
    fn rejects_zero_backoff_and_empty_hosts() {
        let err = parse_config("[daemon]\nbackoff_ms = [100, 0]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "daemon.backoff_ms"));

        let err = parse_config("[hosts.idle]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "hosts.idle.devices"));

        assert!(parse_config("[hosts.idle]\nallow_empty = true\n").is_ok());
    }

    #[test]
    fn unknown_host_lookup_fails() {
        let config = parse_config(SAMPLE).unwrap();
        let Err(ConfigError::UnknownHost { host, available }) = config.host("attic") else {
            panic!("expected an unknown host error");
        };
        assert_eq!(host, "attic");
        assert_eq!(available, vec!["boiler".to_owned()]);
    }

    #[test]
    fn renders_back_to_toml() {
        let config = parse_config(SAMPLE).unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed = parse_config(&rendered).unwrap();

        assert_eq!(reparsed.daemon.backoff_ms, vec![100, 200]);
        assert_eq!(reparsed.hosts["boiler"].devices.len(), 2);
    }
}
