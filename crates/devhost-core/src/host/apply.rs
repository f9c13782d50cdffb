// ── Configuration apply ──
//
// Applying a snapshot runs under the host lock for the whole pass:
// validate everything, create or reconfigure each item in order, stop
// and destroy what a full snapshot omits, then swap the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{DeviceEntry, HostInner, Registry};
use crate::device::{
    Device, DeviceDriver, HostAttachment, HostHooks, ReconfigureOutcome, validate_configuration,
};
use crate::error::CoreError;
use crate::model::{ConfigurationStatus, DeviceConfiguration};

/// A set of device configurations to apply to one host.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationSnapshot<C> {
    pub items: Vec<C>,
    /// Only touch the named items; leave every other device alone.
    pub partial: bool,
    /// Key presented when reconfiguring devices that have one set.
    pub controller_key: Option<String>,
}

impl<C> ConfigurationSnapshot<C> {
    /// A snapshot describing the host's complete device set.
    pub fn full(items: Vec<C>) -> Self {
        Self {
            items,
            partial: false,
            controller_key: None,
        }
    }

    pub fn partial(items: Vec<C>) -> Self {
        Self {
            items,
            partial: true,
            controller_key: None,
        }
    }

    #[must_use]
    pub fn with_controller_key(mut self, key: impl Into<String>) -> Self {
        self.controller_key = Some(key.into());
        self
    }
}

/// Per-item result of an apply pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ApplyOutcome {
    Created,
    CreateFailed,
    CreatedAndStarted,
    CreatedButStartFailed,
    Updated,
    UpdateFailed,
    UpdateFailedRestartRequired,
    UpdatedButStartFailed,
    InvalidConfiguration,
    ConfigurationCanceled,
    InvalidControllerKey,
    UnexpectedError,
}

impl ApplyOutcome {
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Created | Self::CreatedAndStarted | Self::Updated)
    }

    /// Map an error to an outcome; `fallback` covers ordinary hook failures.
    pub fn from_error(error: &CoreError, fallback: Self) -> Self {
        match error {
            CoreError::Canceled => Self::ConfigurationCanceled,
            CoreError::ControllerKeyMismatch { .. } => Self::InvalidControllerKey,
            CoreError::InvalidConfiguration { .. } => Self::InvalidConfiguration,
            CoreError::DeviceDestroyed { .. } | CoreError::Internal(_) => Self::UnexpectedError,
            _ => fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub name: String,
    pub outcome: ApplyOutcome,
    pub error: Option<CoreError>,
}

/// Everything an apply pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// One entry per snapshot item, in snapshot order.
    pub items: Vec<ItemReport>,
    /// Devices a full apply stopped and destroyed.
    pub destroyed: Vec<String>,
    /// Devices a partial apply left untouched.
    pub unconfigured: Vec<String>,
}

impl ApplyReport {
    pub fn outcome(&self, name: &str) -> Option<ApplyOutcome> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(|item| item.outcome.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

struct ItemResult<D: DeviceDriver> {
    entry: Option<DeviceEntry<D>>,
    outcome: ApplyOutcome,
    error: Option<CoreError>,
}

impl<D: DeviceDriver> ItemResult<D> {
    fn ok(entry: DeviceEntry<D>, outcome: ApplyOutcome) -> Self {
        Self {
            entry: Some(entry),
            outcome,
            error: None,
        }
    }

    fn failed(entry: Option<DeviceEntry<D>>, outcome: ApplyOutcome, error: CoreError) -> Self {
        Self {
            entry,
            outcome,
            error: Some(error),
        }
    }
}

impl<D: DeviceDriver> HostInner<D> {
    pub(crate) async fn apply(
        &self,
        snapshot: ConfigurationSnapshot<D::Config>,
        allow_empty: bool,
    ) -> Result<ApplyReport, CoreError> {
        let _guard = self.lock.lock().await;
        self.validate_snapshot(&snapshot, allow_empty)?;

        let current = self.registry.load_full();
        let mut next: Registry<D> = if snapshot.partial {
            (*current).clone()
        } else {
            HashMap::new()
        };
        let mut report = ApplyReport::default();
        let presented = snapshot.controller_key.as_deref();

        for item in &snapshot.items {
            let name = item.name().to_owned();
            let result = match current.get(&name) {
                Some(existing) => self.update_device(existing, item, presented).await,
                None => self.create_device(item).await,
            };
            debug!(host = %self.name, device = %name, outcome = %result.outcome, "configuration item applied");
            if let Some(mut entry) = result.entry {
                entry.last_result = result.outcome;
                next.insert(name.clone(), entry);
            }
            report.items.push(ItemReport {
                name,
                outcome: result.outcome,
                error: result.error,
            });
        }

        let mentioned: HashSet<&str> = snapshot.items.iter().map(|c| c.name()).collect();
        let mut omitted: Vec<&String> = current
            .keys()
            .filter(|name| !mentioned.contains(name.as_str()))
            .collect();
        omitted.sort();

        if snapshot.partial {
            report.unconfigured = omitted.into_iter().cloned().collect();
        } else {
            for name in omitted {
                let Some(entry) = current.get(name) else {
                    continue;
                };
                // Stop explicitly so a failing stop hook is reported
                // separately from teardown.
                if let Err(e) = entry.device.stop_held().await {
                    warn!(host = %self.name, device = %name, error = %e, "failed to stop omitted device");
                }
                if let Err(e) = entry.device.destroy_held().await {
                    warn!(host = %self.name, device = %name, error = %e, "failed to destroy omitted device");
                }
                report.destroyed.push(name.clone());
            }
        }

        self.store_registry(next);

        info!(
            host = %self.name,
            items = report.items.len(),
            failures = report.failures().count(),
            destroyed = report.destroyed.len(),
            unconfigured = report.unconfigured.len(),
            partial = snapshot.partial,
            "configuration applied"
        );
        Ok(report)
    }

    fn validate_snapshot(
        &self,
        snapshot: &ConfigurationSnapshot<D::Config>,
        allow_empty: bool,
    ) -> Result<(), CoreError> {
        if snapshot.items.is_empty() && !allow_empty {
            return Err(CoreError::EmptyConfiguration {
                host: self.name.to_string(),
            });
        }
        let mut seen = HashSet::new();
        for item in &snapshot.items {
            validate_configuration(item)?;
            if !seen.insert(item.name()) {
                return Err(CoreError::DuplicateDevice {
                    name: item.name().to_owned(),
                });
            }
        }
        Ok(())
    }

    async fn create_device(&self, config: &D::Config) -> ItemResult<D> {
        let device = match self
            .factories
            .create(config)
            .and_then(|driver| Device::new(driver, config))
        {
            Ok(device) => device,
            Err(e) => {
                warn!(host = %self.name, device = config.name(), error = %e, "failed to create device");
                let outcome = match e {
                    CoreError::InvalidConfiguration { .. } => ApplyOutcome::InvalidConfiguration,
                    _ => ApplyOutcome::CreateFailed,
                };
                return ItemResult::failed(None, outcome, e);
            }
        };

        if let Err(e) = device.host_set_host(self.attachment(config.name())) {
            // Fresh device, cannot already be attached.
            let _ = device.destroy_held().await;
            return ItemResult::failed(None, ApplyOutcome::UnexpectedError, e);
        }

        let entry = DeviceEntry {
            device: device.clone(),
            applied: Arc::new(config.clone()),
            last_result: ApplyOutcome::Created,
        };
        if !config.status().wants_running() {
            return ItemResult::ok(entry, ApplyOutcome::Created);
        }
        match device.start_held().await {
            Ok(()) => ItemResult::ok(entry, ApplyOutcome::CreatedAndStarted),
            // The device stays registered; AlwaysRunning devices are now
            // tracked for the daemon.
            Err(e) => ItemResult::failed(Some(entry), ApplyOutcome::CreatedButStartFailed, e),
        }
    }

    async fn update_device(
        &self,
        existing: &DeviceEntry<D>,
        config: &D::Config,
        presented: Option<&str>,
    ) -> ItemResult<D> {
        let device = &existing.device;
        let keep = || Some(existing.clone());

        if let Err(e) = device.check_controller_key(presented) {
            return ItemResult::failed(keep(), ApplyOutcome::InvalidControllerKey, e);
        }

        match device.reconfigure_held(config).await {
            Ok(ReconfigureOutcome::RestartRequired) => {
                let error = CoreError::RestartRequired {
                    device: device.full_name(),
                };
                return ItemResult::failed(keep(), ApplyOutcome::UpdateFailedRestartRequired, error);
            }
            Ok(ReconfigureOutcome::Updated | ReconfigureOutcome::Unchanged) => {}
            Err(e) => {
                let outcome = ApplyOutcome::from_error(&e, ApplyOutcome::UpdateFailed);
                return ItemResult::failed(keep(), outcome, e);
            }
        }

        let entry = DeviceEntry {
            device: device.clone(),
            applied: Arc::new(config.clone()),
            last_result: ApplyOutcome::Updated,
        };
        let policy = config.status();
        let status = device.status();
        if policy == ConfigurationStatus::Disabled && status.is_running() {
            if let Err(e) = device.stop_held().await {
                warn!(host = %self.name, device = %device.name(), error = %e, "stop of disabled device failed");
            }
        } else if policy.wants_running() && !status.is_running() {
            if let Err(e) = device.start_held().await {
                return ItemResult::failed(Some(entry), ApplyOutcome::UpdatedButStartFailed, e);
            }
        }
        ItemResult::ok(entry, ApplyOutcome::Updated)
    }

    fn attachment(&self, device: &str) -> HostAttachment {
        let hooks: std::sync::Weak<dyn HostHooks> = self.me.clone();
        HostAttachment {
            host_name: Arc::clone(&self.name),
            full_name: Arc::from(format!("{}.{device}", self.name)),
            lock: Arc::clone(&self.lock),
            hooks,
        }
    }
}
