// ── Device state types ──

use serde::{Deserialize, Serialize};

/// Runtime lifecycle state of a device.
///
/// `Starting` and `Stopping` are transient and only observable while a
/// structural operation is in flight. `Destroyed` is terminal.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum DeviceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Destroyed,
}

impl DeviceStatus {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_destroyed(self) -> bool {
        matches!(self, Self::Destroyed)
    }

    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

/// Running policy requested by a device's configuration.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ConfigurationStatus {
    /// Created but never started by the host.
    Disabled,
    /// May be started on demand; the host leaves it alone.
    #[default]
    Runnable,
    /// Started by the host when the configuration is applied.
    RunnableStarted,
    /// Started on apply and restarted by the daemon whenever it stops.
    AlwaysRunning,
}

impl ConfigurationStatus {
    /// Whether applying this configuration should leave the device running.
    pub fn wants_running(self) -> bool {
        matches!(self, Self::RunnableStarted | Self::AlwaysRunning)
    }

    pub fn is_always_running(self) -> bool {
        matches!(self, Self::AlwaysRunning)
    }
}

/// What a queued command does when its device is not `Running`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum StoppedBehavior {
    /// Execute the handler regardless of device status.
    RunAnyway,
    /// Settle with [`CoreError::DeviceNotRunning`](crate::CoreError::DeviceNotRunning).
    #[default]
    FailImmediately,
    /// Settle as canceled.
    Cancel,
    /// Park the command and replay it, in order, once the device runs again.
    WaitForNextStart,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn wants_running_only_for_started_policies() {
        assert!(!ConfigurationStatus::Disabled.wants_running());
        assert!(!ConfigurationStatus::Runnable.wants_running());
        assert!(ConfigurationStatus::RunnableStarted.wants_running());
        assert!(ConfigurationStatus::AlwaysRunning.wants_running());
    }

    #[test]
    fn configuration_status_parses_from_name() {
        assert_eq!(
            ConfigurationStatus::from_str("AlwaysRunning"),
            Ok(ConfigurationStatus::AlwaysRunning)
        );
        assert!(ConfigurationStatus::from_str("Sometimes").is_err());
    }

    #[test]
    fn transitional_states() {
        assert!(DeviceStatus::Starting.is_transitional());
        assert!(DeviceStatus::Stopping.is_transitional());
        assert!(!DeviceStatus::Running.is_transitional());
    }
}
