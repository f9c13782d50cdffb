// ── Device host ──
//
// Named registry of devices sharing one driver type. The registry is an
// immutable map behind `ArcSwap`: readers load it without locking,
// writers hold the host lock, build a new map and store it.

mod apply;
mod factory;
mod tracker;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use apply::{ApplyOutcome, ApplyReport, ConfigurationSnapshot, ItemReport};
pub use factory::{DeviceFactories, DeviceFactory, candidate_types};

use self::tracker::Tracker;
use crate::command::{Command, StructuralCommand, StructuralResult};
use crate::daemon::{DaemonSignal, SupervisedDevice, SupervisedHost, TrackedDevice};
use crate::device::{Device, DeviceDriver, HostHooks, ReconfigureOutcome};
use crate::error::CoreError;
use crate::model::{ConfigurationStatus, DeviceStatus};

pub(crate) struct DeviceEntry<D: DeviceDriver> {
    device: Device<D>,
    /// The configuration as last applied by the host.
    applied: Arc<D::Config>,
    last_result: ApplyOutcome,
}

impl<D: DeviceDriver> Clone for DeviceEntry<D> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            applied: Arc::clone(&self.applied),
            last_result: self.last_result,
        }
    }
}

pub(crate) type Registry<D> = HashMap<String, DeviceEntry<D>>;

pub(crate) struct HostInner<D: DeviceDriver> {
    name: Arc<str>,
    me: Weak<HostInner<D>>,
    registry: ArcSwap<Registry<D>>,
    /// Held for every structural mutation, including whole apply passes.
    lock: Arc<Mutex<()>>,
    factories: DeviceFactories<D>,
    tracker: Tracker,
    names: watch::Sender<Vec<String>>,
}

/// Registry and orchestrator for a named set of devices.
///
/// Cheaply cloneable handle; all clones share state.
pub struct DeviceHost<D: DeviceDriver> {
    inner: Arc<HostInner<D>>,
}

impl<D: DeviceDriver> Clone for DeviceHost<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: DeviceDriver> DeviceHost<D> {
    pub fn new(name: impl Into<String>, factories: DeviceFactories<D>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (names, _) = watch::channel(Vec::new());
        let inner = Arc::new_cyclic(|me| HostInner {
            name,
            me: me.clone(),
            registry: ArcSwap::from_pointee(HashMap::new()),
            lock: Arc::new(Mutex::new(())),
            factories,
            tracker: Tracker::default(),
            names,
        });
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // ── Lock-free reads ──────────────────────────────────────────────

    pub fn find(&self, device: &str) -> Option<Device<D>> {
        self.inner
            .registry
            .load()
            .get(device)
            .map(|entry| entry.device.clone())
    }

    pub fn get(&self, device: &str) -> Result<Device<D>, CoreError> {
        self.find(device).ok_or_else(|| self.inner.not_found(device))
    }

    /// All devices, sorted by name.
    pub fn devices(&self) -> Vec<Device<D>> {
        let registry = self.inner.registry.load();
        let mut devices: Vec<_> = registry.values().map(|e| e.device.clone()).collect();
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        devices
    }

    pub fn device_names(&self) -> Vec<String> {
        sorted_names(&self.inner.registry.load())
    }

    pub fn len(&self) -> usize {
        self.inner.registry.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone of the configuration last applied to `device` by the host.
    pub fn applied_configuration(&self, device: &str) -> Option<D::Config> {
        self.inner
            .registry
            .load()
            .get(device)
            .map(|entry| D::Config::clone(&entry.applied))
    }

    pub fn last_result(&self, device: &str) -> Option<ApplyOutcome> {
        self.inner
            .registry
            .load()
            .get(device)
            .map(|entry| entry.last_result)
    }

    /// Sorted device names, republished after every registry swap.
    pub fn subscribe_registry(&self) -> watch::Receiver<Vec<String>> {
        self.inner.names.subscribe()
    }

    /// AlwaysRunning devices currently awaiting a restart.
    pub fn tracked_devices(&self) -> Vec<TrackedDevice> {
        self.inner.tracker.snapshot()
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Route a queued command to its target device.
    pub fn send_command(&self, command: Command<D::Command, D::Output>) -> bool {
        let target = command.target().clone();
        if target.host.as_deref().is_some_and(|host| host != self.name()) {
            command.settle(Err(CoreError::DeviceNotFound {
                host: target.host.unwrap_or_default(),
                device: target.device,
            }));
            return false;
        }
        match self.find(&target.device) {
            Some(device) => device.send_command(command),
            None => {
                command.settle(Err(self.inner.not_found(&target.device)));
                false
            }
        }
    }

    // ── Structural operations ────────────────────────────────────────

    /// Apply a configuration snapshot. Validation failures reject the
    /// whole snapshot without touching any device.
    pub async fn apply_configuration(
        &self,
        snapshot: ConfigurationSnapshot<D::Config>,
        allow_empty: bool,
    ) -> Result<ApplyReport, CoreError> {
        self.inner.apply(snapshot, allow_empty).await
    }

    /// Stop, destroy and unregister one device.
    pub async fn destroy_device(&self, device: &str) -> Result<(), CoreError> {
        let _guard = self.inner.lock.lock().await;
        let target = self.get(device)?;
        target.destroy_held().await
    }

    /// Run a structural command against one device under the host lock.
    pub async fn execute_structural(
        &self,
        device: &str,
        command: StructuralCommand<D::Config>,
        presented_key: Option<&str>,
    ) -> Result<StructuralResult, CoreError> {
        let _guard = self.inner.lock.lock().await;
        let target = self.get(device)?;
        let next = match &command {
            StructuralCommand::Reconfigure(config) => Some(config.clone()),
            _ => None,
        };
        let result = target.execute_structural_held(command, presented_key).await?;
        if let (Some(config), StructuralResult::Reconfigured(outcome)) = (next, result) {
            if outcome != ReconfigureOutcome::RestartRequired {
                self.inner.record_applied(device, config);
            }
        }
        Ok(result)
    }

    /// Destroy every device and empty the registry.
    pub async fn clear(&self) {
        self.inner.destroy_all().await;
    }

    // ── Daemon wiring ────────────────────────────────────────────────

    pub(crate) fn attach_daemon(&self, signal: DaemonSignal) {
        self.inner.tracker.attach(signal);
    }

    pub(crate) fn supervised(&self) -> Weak<dyn SupervisedHost> {
        let weak: Weak<dyn SupervisedHost> = Arc::<HostInner<D>>::downgrade(&self.inner);
        weak
    }
}

impl<D: DeviceDriver> fmt::Debug for DeviceHost<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHost")
            .field("name", &self.inner.name)
            .field("devices", &self.device_names())
            .finish_non_exhaustive()
    }
}

// ── Internals ────────────────────────────────────────────────────────

fn sorted_names<D: DeviceDriver>(registry: &Registry<D>) -> Vec<String> {
    let mut names: Vec<String> = registry.keys().cloned().collect();
    names.sort();
    names
}

impl<D: DeviceDriver> HostInner<D> {
    fn not_found(&self, device: &str) -> CoreError {
        CoreError::DeviceNotFound {
            host: self.name.to_string(),
            device: device.to_owned(),
        }
    }

    /// Replace the registry. Callers hold the host lock.
    fn store_registry(&self, registry: Registry<D>) {
        let names = sorted_names(&registry);
        self.registry.store(Arc::new(registry));
        self.names.send_replace(names);
    }

    fn record_applied(&self, device: &str, config: D::Config) {
        let config = Arc::new(config);
        self.registry.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(entry) = next.get_mut(device) {
                entry.applied = Arc::clone(&config);
                entry.last_result = ApplyOutcome::Updated;
            }
            next
        });
    }

    /// Drop a destroyed device from the registry. A live device that has
    /// since taken the same name is left alone.
    fn forget(&self, device: &str) {
        let mut removed = false;
        self.registry.rcu(|current| {
            removed = false;
            match current.get(device) {
                Some(entry) if entry.device.status().is_destroyed() => {
                    let mut next = (**current).clone();
                    next.remove(device);
                    removed = true;
                    Arc::new(next)
                }
                _ => Arc::clone(current),
            }
        });
        if removed {
            debug!(host = %self.name, device, "destroyed device removed from registry");
            self.names.send_replace(sorted_names(&self.registry.load()));
        }
    }

    async fn destroy_all(&self) {
        let _guard = self.lock.lock().await;
        let registry = self.registry.load_full();
        for name in sorted_names(&registry) {
            if let Some(entry) = registry.get(&name) {
                if let Err(e) = entry.device.destroy_held().await {
                    warn!(host = %self.name, device = %name, error = %e, "failed to destroy device");
                }
            }
        }
        self.store_registry(HashMap::new());
        self.tracker.clear();
        info!(host = %self.name, "host cleared");
    }
}

impl<D: DeviceDriver> HostHooks for HostInner<D> {
    fn device_state_changed(
        &self,
        device: Arc<dyn SupervisedDevice>,
        status: DeviceStatus,
        policy: ConfigurationStatus,
    ) {
        if status == DeviceStatus::Destroyed {
            self.forget(device.name());
        }
        self.tracker.observe(device, status, policy);
    }
}

impl<D: DeviceDriver> SupervisedHost for HostInner<D> {
    fn host_name(&self) -> &str {
        &self.name
    }

    fn tracked(&self) -> Vec<TrackedDevice> {
        self.tracker.snapshot()
    }

    fn reschedule(&self, device: &str, retry_count: u32, next_attempt: Instant) -> bool {
        self.tracker.reschedule(device, retry_count, next_attempt)
    }

    fn untrack(&self, device: &str) -> bool {
        self.tracker.untrack(device)
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.destroy_all())
    }
}
