// ── Object-safe views the daemon works through ──
//
// Hosts and devices are generic over their driver; the daemon is not.
// These traits erase the driver type so one daemon can supervise hosts
// of different device families.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::error::CoreError;
use crate::model::DeviceStatus;

/// A device the daemon may restart.
pub trait SupervisedDevice: Send + Sync {
    fn name(&self) -> &str;
    fn full_name(&self) -> String;
    fn status(&self) -> DeviceStatus;
    /// Structural start, serialized with the owning host's lock.
    fn start(&self) -> BoxFuture<'_, Result<(), CoreError>>;
}

/// One entry of a host's restart tracker.
#[derive(Clone)]
pub struct TrackedDevice {
    pub device: Arc<dyn SupervisedDevice>,
    pub retry_count: u32,
    pub next_attempt: Instant,
}

impl std::fmt::Debug for TrackedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedDevice")
            .field("device", &self.device.name())
            .field("retry_count", &self.retry_count)
            .field("next_attempt", &self.next_attempt)
            .finish()
    }
}

/// A host registered with the daemon.
pub trait SupervisedHost: Send + Sync {
    fn host_name(&self) -> &str;

    /// Snapshot of the restart tracker.
    fn tracked(&self) -> Vec<TrackedDevice>;

    /// Earliest `next_attempt` across tracked devices.
    fn next_retry_at(&self) -> Option<Instant> {
        self.tracked().iter().map(|t| t.next_attempt).min()
    }

    /// Update an entry. Returns `false` if the device was untracked in
    /// the meantime; the entry is not resurrected.
    fn reschedule(&self, device: &str, retry_count: u32, next_attempt: Instant) -> bool;

    fn untrack(&self, device: &str) -> bool;

    /// Stop and destroy every device of the host.
    fn clear(&self) -> BoxFuture<'_, ()>;
}
