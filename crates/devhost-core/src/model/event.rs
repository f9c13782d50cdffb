// ── Device lifetime events ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::DeviceStatus;

/// What changed on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifetimeEventKind {
    StatusChanged {
        from: DeviceStatus,
        to: DeviceStatus,
    },
    ConfigurationChanged,
    ControllerKeyChanged {
        /// Whether a key is set after the change. The key itself is never published.
        key_set: bool,
    },
}

/// One entry of a device's ordered lifetime-event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeEvent {
    /// Per-device sequence number, starting at 1 and strictly increasing.
    pub sequence: u64,
    /// Full name of the emitting device.
    pub device: String,
    pub timestamp: DateTime<Utc>,
    pub kind: LifetimeEventKind,
}

impl LifetimeEvent {
    pub fn status_change(&self) -> Option<(DeviceStatus, DeviceStatus)> {
        match self.kind {
            LifetimeEventKind::StatusChanged { from, to } => Some((from, to)),
            _ => None,
        }
    }
}
