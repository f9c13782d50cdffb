// ── AlwaysRunning tracker ──
//
// Devices whose configuration demands AlwaysRunning but that are not
// running. Owned by the host, consumed by the daemon. Every change wakes
// the daemon so it can recompute its next deadline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::Instant;
use tracing::debug;

use crate::daemon::{DaemonSignal, SupervisedDevice, TrackedDevice};
use crate::model::{ConfigurationStatus, DeviceStatus};

#[derive(Default)]
pub(crate) struct Tracker {
    entries: Mutex<HashMap<String, TrackedDevice>>,
    signal: Mutex<Option<DaemonSignal>>,
}

impl Tracker {
    pub(crate) fn attach(&self, signal: DaemonSignal) {
        *self.signal.lock().unwrap_or_else(PoisonError::into_inner) = Some(signal);
        self.wake();
    }

    fn wake(&self) {
        if let Some(signal) = self
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            signal.notify();
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, TrackedDevice>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update tracking from a device state change.
    ///
    /// Running or destroyed devices leave the tracker; a stopped
    /// AlwaysRunning device enters it (an existing entry keeps its retry
    /// count); transitional states change nothing.
    pub(crate) fn observe(
        &self,
        device: Arc<dyn SupervisedDevice>,
        status: DeviceStatus,
        policy: ConfigurationStatus,
    ) {
        if status.is_transitional() {
            return;
        }
        let changed = if status == DeviceStatus::Stopped && policy.is_always_running() {
            self.track(device)
        } else {
            self.untrack(device.name())
        };
        if changed {
            self.wake();
        }
    }

    fn track(&self, device: Arc<dyn SupervisedDevice>) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(device.name()) {
            return false;
        }
        debug!(device = %device.full_name(), "tracking always-running device");
        entries.insert(
            device.name().to_owned(),
            TrackedDevice {
                device,
                retry_count: 0,
                next_attempt: Instant::now(),
            },
        );
        true
    }

    pub(crate) fn untrack(&self, name: &str) -> bool {
        let removed = self.entries().remove(name).is_some();
        if removed {
            debug!(device = name, "untracked device");
        }
        removed
    }

    pub(crate) fn reschedule(&self, name: &str, retry_count: u32, next_attempt: Instant) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(name) else {
            return false;
        };
        entry.retry_count = retry_count;
        entry.next_attempt = next_attempt;
        true
    }

    pub(crate) fn snapshot(&self) -> Vec<TrackedDevice> {
        let mut tracked: Vec<_> = self.entries().values().cloned().collect();
        tracked.sort_by(|a, b| a.device.name().cmp(b.device.name()));
        tracked
    }

    pub(crate) fn clear(&self) {
        let had_entries = {
            let mut entries = self.entries();
            let had = !entries.is_empty();
            entries.clear();
            had
        };
        if had_entries {
            self.wake();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::future::BoxFuture;

    use super::*;
    use crate::error::CoreError;

    struct Stub(&'static str);

    impl SupervisedDevice for Stub {
        fn name(&self) -> &str {
            self.0
        }
        fn full_name(&self) -> String {
            format!("host.{}", self.0)
        }
        fn status(&self) -> DeviceStatus {
            DeviceStatus::Stopped
        }
        fn start(&self) -> BoxFuture<'_, Result<(), CoreError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn stopped_always_running_devices_are_tracked_once() {
        let tracker = Tracker::default();
        let signal = DaemonSignal::new();
        let mut wake = signal.subscribe();
        tracker.attach(signal);
        wake.borrow_and_update();

        let stub: Arc<dyn SupervisedDevice> = Arc::new(Stub("pump"));
        tracker.observe(Arc::clone(&stub), DeviceStatus::Stopped, ConfigurationStatus::AlwaysRunning);
        assert!(wake.has_changed().unwrap());

        tracker.reschedule("pump", 2, Instant::now());
        tracker.observe(Arc::clone(&stub), DeviceStatus::Stopped, ConfigurationStatus::AlwaysRunning);
        assert_eq!(tracker.snapshot()[0].retry_count, 2);

        tracker.observe(stub, DeviceStatus::Running, ConfigurationStatus::AlwaysRunning);
        assert!(tracker.snapshot().is_empty());
    }

    #[tokio::test]
    async fn transitional_statuses_leave_entries_alone() {
        let tracker = Tracker::default();
        let stub: Arc<dyn SupervisedDevice> = Arc::new(Stub("valve"));
        tracker.observe(Arc::clone(&stub), DeviceStatus::Starting, ConfigurationStatus::AlwaysRunning);
        assert!(tracker.snapshot().is_empty());

        tracker.observe(Arc::clone(&stub), DeviceStatus::Stopped, ConfigurationStatus::AlwaysRunning);
        tracker.observe(Arc::clone(&stub), DeviceStatus::Starting, ConfigurationStatus::AlwaysRunning);
        tracker.observe(stub, DeviceStatus::Stopping, ConfigurationStatus::Disabled);
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn other_policies_are_not_tracked() {
        let tracker = Tracker::default();
        tracker.observe(Arc::new(Stub("fan")), DeviceStatus::Stopped, ConfigurationStatus::RunnableStarted);
        assert!(tracker.snapshot().is_empty());
    }

    #[tokio::test]
    async fn reschedule_does_not_resurrect() {
        let tracker = Tracker::default();
        assert!(!tracker.reschedule("ghost", 1, Instant::now()));
        assert!(tracker.snapshot().is_empty());
    }
}
