// ── Runtime supervision configuration ──
//
// These types describe *how* the daemon supervises hosts. They never
// touch disk: `devhost-config` (or any embedder) builds a `DaemonConfig`
// and hands it in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default restart delays, indexed by consecutive failure count.
pub const DEFAULT_BACKOFF_MS: [u64; 4] = [250, 300, 500, 750];

/// What the backoff policy does once its delay table is used up.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExhaustedBehavior {
    /// Stop retrying; the device stays stopped until something else
    /// starts it.
    #[default]
    GiveUp,
    /// Keep retrying at the last delay of the table.
    RetryForever,
}

/// What daemon shutdown does to the devices it supervises.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopBehavior {
    /// Leave devices as they are.
    #[default]
    None,
    /// Clear every registered host in the background.
    StopDevices,
    /// Clear every registered host and wait for it.
    StopDevicesAndWait,
}

/// Restart delay table for [`BackoffRetryPolicy`](crate::daemon::BackoffRetryPolicy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub delays_ms: Vec<u64>,
    pub on_exhausted: ExhaustedBehavior,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            delays_ms: DEFAULT_BACKOFF_MS.to_vec(),
            on_exhausted: ExhaustedBehavior::default(),
        }
    }
}

/// Configuration for a [`DeviceHostDaemon`](crate::daemon::DeviceHostDaemon).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub backoff: BackoffConfig,
    /// Delay before re-consulting a retry policy that returned an error.
    pub policy_failure_delay: Duration,
    /// Used by [`DeviceHostDaemon::stop`](crate::daemon::DeviceHostDaemon::stop).
    pub stop_behavior: StopBehavior,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            policy_failure_delay: Duration::from_secs(1),
            stop_behavior: StopBehavior::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.backoff.delays_ms, vec![250, 300, 500, 750]);
        assert_eq!(config.backoff.on_exhausted, ExhaustedBehavior::GiveUp);
        assert_eq!(config.policy_failure_delay, Duration::from_secs(1));
        assert_eq!(config.stop_behavior, StopBehavior::None);
    }

    #[test]
    fn behaviors_parse_snake_case() {
        assert_eq!(
            ExhaustedBehavior::from_str("retry_forever").unwrap(),
            ExhaustedBehavior::RetryForever
        );
        assert_eq!(
            StopBehavior::from_str("stop_devices_and_wait").unwrap(),
            StopBehavior::StopDevicesAndWait
        );
        assert_eq!(StopBehavior::StopDevices.to_string(), "stop_devices");
    }
}
