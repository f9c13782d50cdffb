// ── Device ──
//
// A device pairs a driver with the machinery every device needs: a FIFO
// command queue drained by its own task, the lifecycle state machine, a
// private configuration slot and a lifetime event stream.
//
// Locking: `core` is the execution gate. Exactly one of {command
// handler, structural operation} holds it at a time. Public structural
// methods additionally take the owning host's lock so they serialize
// with registry mutation; the host calls the `*_held` variants while it
// already holds that lock.

mod command_loop;
mod driver;
mod events;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::{ArcSwap, ArcSwapOption};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use driver::{DeviceContext, DeviceDriver, ReconfigureOutcome};
pub(crate) use driver::DeviceSignal;

use self::events::EventHub;
use crate::command::{Command, StructuralCommand, StructuralResult};
use crate::daemon::SupervisedDevice;
use crate::error::CoreError;
use crate::model::{ConfigurationStatus, DeviceConfiguration, DeviceStatus, LifetimeEventKind};
use crate::stream::LifetimeEventStream;

// ── Host attachment ──────────────────────────────────────────────────

/// Callbacks from a device into its owning host.
pub(crate) trait HostHooks: Send + Sync {
    /// Called on every status change and on running-policy changes.
    /// Must not block or take the host lock.
    fn device_state_changed(
        &self,
        device: Arc<dyn SupervisedDevice>,
        status: DeviceStatus,
        policy: ConfigurationStatus,
    );
}

/// Set once when a host adopts the device.
#[derive(Clone)]
pub(crate) struct HostAttachment {
    pub(crate) host_name: Arc<str>,
    pub(crate) full_name: Arc<str>,
    pub(crate) lock: Arc<Mutex<()>>,
    pub(crate) hooks: Weak<dyn HostHooks>,
}

// ── Device handle ────────────────────────────────────────────────────

struct DeviceCore<D: DeviceDriver> {
    driver: D,
    config: D::Config,
}

pub(crate) struct DeviceInner<D: DeviceDriver> {
    name: Arc<str>,
    me: Weak<DeviceInner<D>>,
    host: OnceLock<HostAttachment>,
    core: Mutex<DeviceCore<D>>,
    status: watch::Sender<DeviceStatus>,
    /// Clone of the configuration in `core`, readable without the gate.
    published: ArcSwap<D::Config>,
    controller_key: ArcSwapOption<String>,
    commands: mpsc::UnboundedSender<Command<D::Command, D::Output>>,
    signals: mpsc::UnboundedSender<DeviceSignal>,
    events: EventHub,
    destroyed: CancellationToken,
}

/// A managed device.
///
/// Cheaply cloneable; all clones share the same queue and state. Must be
/// created inside a tokio runtime: construction spawns the command loop.
pub struct Device<D: DeviceDriver> {
    inner: Arc<DeviceInner<D>>,
}

impl<D: DeviceDriver> Clone for Device<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: DeviceDriver> Device<D> {
    /// Create a stopped device around `driver`. The device keeps its own
    /// clone of `config`.
    pub fn new(driver: D, config: &D::Config) -> Result<Self, CoreError> {
        validate_configuration(config)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(DeviceStatus::Stopped);
        let destroyed = CancellationToken::new();
        let name: Arc<str> = Arc::from(config.name());

        let inner = Arc::new_cyclic(|me| DeviceInner {
            name: Arc::clone(&name),
            me: me.clone(),
            host: OnceLock::new(),
            core: Mutex::new(DeviceCore {
                driver,
                config: config.clone(),
            }),
            status: status_tx,
            published: ArcSwap::from_pointee(config.clone()),
            controller_key: ArcSwapOption::empty(),
            commands: command_tx,
            signals: signal_tx,
            events: EventHub::new(),
            destroyed: destroyed.clone(),
        });

        // The loop holds only a weak reference: dropping the last handle
        // closes the queue and ends the task.
        tokio::spawn(command_loop::run(
            Arc::downgrade(&inner),
            Arc::clone(&name),
            command_rx,
            signal_rx,
            status_rx,
            destroyed,
        ));

        debug!(device = %name, kind = config.kind(), "device created");
        Ok(Self { inner })
    }

    // ── Identity & state ─────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `<host>.<device>` once attached, the bare name before.
    pub fn full_name(&self) -> String {
        self.inner.full_name().to_string()
    }

    pub fn host_name(&self) -> Option<&str> {
        self.inner.host.get().map(|h| &*h.host_name)
    }

    pub fn status(&self) -> DeviceStatus {
        self.inner.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<DeviceStatus> {
        self.inner.status.subscribe()
    }

    /// A clone of the current configuration.
    pub fn configuration(&self) -> D::Config {
        D::Config::clone(&self.inner.published.load())
    }

    pub fn configuration_status(&self) -> ConfigurationStatus {
        self.inner.published.load().status()
    }

    pub fn has_controller_key(&self) -> bool {
        self.inner.controller_key.load().is_some()
    }

    /// Sequence number of the most recent lifetime event.
    pub fn last_event_sequence(&self) -> u64 {
        self.inner.events.last_sequence()
    }

    pub fn subscribe(&self) -> LifetimeEventStream {
        LifetimeEventStream::new(self.inner.full_name(), self.inner.events.subscribe())
    }

    /// Resolves once the device reaches `Destroyed`.
    pub async fn destroyed(&self) {
        self.inner.destroyed.cancelled().await;
    }

    // ── Queued commands ──────────────────────────────────────────────

    /// Enqueue a command. Returns `false` if the device is destroyed; the
    /// command's completion is then settled with `DeviceDestroyed`.
    pub fn send_command(&self, command: Command<D::Command, D::Output>) -> bool {
        if self.inner.status().is_destroyed() {
            command.settle(Err(self.inner.destroyed_error()));
            return false;
        }
        match self.inner.commands.send(command) {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                command.settle(Err(self.inner.destroyed_error()));
                false
            }
        }
    }

    /// Send a default command (`FailImmediately`, no key) and wait for it.
    pub async fn execute(&self, payload: D::Command) -> Result<D::Output, CoreError> {
        let command = Command::new(self.name(), payload);
        let completion = command.completion();
        self.send_command(command);
        completion.wait().await
    }

    // ── Structural operations ────────────────────────────────────────

    pub async fn start(&self) -> Result<(), CoreError> {
        let _host = self.host_guard().await;
        self.start_held().await
    }

    pub async fn stop(&self) -> Result<(), CoreError> {
        let _host = self.host_guard().await;
        self.stop_held().await
    }

    /// Validate and apply a replacement configuration. The caller keeps
    /// ownership of `config`; the device stores its own clone.
    pub async fn reconfigure(&self, config: &D::Config) -> Result<ReconfigureOutcome, CoreError> {
        let _host = self.host_guard().await;
        self.reconfigure_held(config).await
    }

    /// Stop (if running), tear down and mark `Destroyed`. Idempotent.
    pub async fn destroy(&self) -> Result<(), CoreError> {
        let _host = self.host_guard().await;
        self.destroy_held().await
    }

    /// Replace the controller key. `presented` must match the current key
    /// unless none is set.
    pub async fn set_controller_key(
        &self,
        key: Option<String>,
        presented: Option<&str>,
    ) -> Result<(), CoreError> {
        let _host = self.host_guard().await;
        self.set_controller_key_held(key, presented).await
    }

    /// Run a structural command. A presented key must match the device's
    /// key (or the device must have none).
    pub async fn execute_structural(
        &self,
        command: StructuralCommand<D::Config>,
        presented: Option<&str>,
    ) -> Result<StructuralResult, CoreError> {
        let _host = self.host_guard().await;
        self.execute_structural_held(command, presented).await
    }

    // ── Host-facing (host lock already held) ─────────────────────────

    pub(crate) fn host_set_host(&self, attachment: HostAttachment) -> Result<(), CoreError> {
        let host = Arc::clone(&attachment.host_name);
        self.inner.host.set(attachment).map_err(|_| {
            CoreError::Internal(format!(
                "device '{}' is already attached to a host",
                self.inner.name
            ))
        })?;
        debug!(device = %self.inner.name, %host, "device attached to host");
        Ok(())
    }

    pub(crate) async fn start_held(&self) -> Result<(), CoreError> {
        let mut core = self.inner.core.lock().await;
        self.inner.start_gated(&mut core).await
    }

    pub(crate) async fn stop_held(&self) -> Result<(), CoreError> {
        let mut core = self.inner.core.lock().await;
        self.inner.stop_gated(&mut core).await
    }

    pub(crate) async fn reconfigure_held(
        &self,
        config: &D::Config,
    ) -> Result<ReconfigureOutcome, CoreError> {
        let mut core = self.inner.core.lock().await;
        self.inner.reconfigure_gated(&mut core, config).await
    }

    pub(crate) async fn destroy_held(&self) -> Result<(), CoreError> {
        let mut core = self.inner.core.lock().await;
        self.inner.destroy_gated(&mut core).await
    }

    pub(crate) async fn set_controller_key_held(
        &self,
        key: Option<String>,
        presented: Option<&str>,
    ) -> Result<(), CoreError> {
        let _core = self.inner.core.lock().await;
        self.inner.replace_controller_key(key, presented)
    }

    pub(crate) async fn execute_structural_held(
        &self,
        command: StructuralCommand<D::Config>,
        presented: Option<&str>,
    ) -> Result<StructuralResult, CoreError> {
        debug!(device = %self.inner.name, command = command.name(), "structural command");
        if let StructuralCommand::SetControllerKey(key) = command {
            self.set_controller_key_held(key, presented).await?;
            return Ok(StructuralResult::Done);
        }
        self.check_controller_key(presented)?;
        match command {
            StructuralCommand::Start => self.start_held().await?,
            StructuralCommand::Stop => self.stop_held().await?,
            StructuralCommand::Destroy => self.destroy_held().await?,
            StructuralCommand::Reconfigure(config) => {
                let outcome = self.reconfigure_held(&config).await?;
                return Ok(StructuralResult::Reconfigured(outcome));
            }
            StructuralCommand::SetControllerKey(_) => {}
        }
        Ok(StructuralResult::Done)
    }

    pub(crate) fn check_controller_key(&self, presented: Option<&str>) -> Result<(), CoreError> {
        if self.inner.key_accepts(presented) {
            Ok(())
        } else {
            Err(self.inner.key_mismatch())
        }
    }

    async fn host_guard(&self) -> Option<OwnedMutexGuard<()>> {
        match self.inner.host.get() {
            Some(host) => Some(Arc::clone(&host.lock).lock_owned().await),
            None => None,
        }
    }
}

impl<D: DeviceDriver> fmt::Debug for Device<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.full_name())
            .field("status", &self.inner.status())
            .finish_non_exhaustive()
    }
}

impl<D: DeviceDriver> SupervisedDevice for Device<D> {
    fn name(&self) -> &str {
        Device::name(self)
    }

    fn full_name(&self) -> String {
        Device::full_name(self)
    }

    fn status(&self) -> DeviceStatus {
        Device::status(self)
    }

    fn start(&self) -> BoxFuture<'_, Result<(), CoreError>> {
        Box::pin(Device::start(self))
    }
}

// ── State machine ────────────────────────────────────────────────────

impl<D: DeviceDriver> DeviceInner<D> {
    fn status(&self) -> DeviceStatus {
        *self.status.borrow()
    }

    fn full_name(&self) -> Arc<str> {
        self.host
            .get()
            .map_or_else(|| Arc::clone(&self.name), |h| Arc::clone(&h.full_name))
    }

    fn context(&self) -> DeviceContext {
        DeviceContext::new(
            Arc::clone(&self.name),
            self.full_name(),
            self.signals.clone(),
        )
    }

    fn handle(&self) -> Option<Device<D>> {
        self.me.upgrade().map(|inner| Device { inner })
    }

    fn destroyed_error(&self) -> CoreError {
        CoreError::DeviceDestroyed {
            device: self.full_name().to_string(),
        }
    }

    fn key_mismatch(&self) -> CoreError {
        CoreError::ControllerKeyMismatch {
            device: self.full_name().to_string(),
        }
    }

    /// A presented key must equal the current one; no key set accepts all.
    fn key_accepts(&self, presented: Option<&str>) -> bool {
        match (self.controller_key.load().as_deref(), presented) {
            (None, _) | (Some(_), None) => true,
            (Some(current), Some(presented)) => current.as_str() == presented,
        }
    }

    fn set_status(&self, to: DeviceStatus) {
        let from = self.status.send_replace(to);
        if from == to {
            return;
        }
        let full_name = self.full_name();
        debug!(device = %full_name, %from, %to, "device status changed");
        self.events
            .emit(&full_name, LifetimeEventKind::StatusChanged { from, to });
        self.notify_host(to);
    }

    fn notify_host(&self, status: DeviceStatus) {
        let Some(hooks) = self.host.get().and_then(|h| h.hooks.upgrade()) else {
            return;
        };
        let Some(device) = self.handle() else {
            return;
        };
        let policy = self.published.load().status();
        hooks.device_state_changed(Arc::new(device), status, policy);
    }

    async fn start_gated(&self, core: &mut DeviceCore<D>) -> Result<(), CoreError> {
        match self.status() {
            DeviceStatus::Running => return Ok(()),
            DeviceStatus::Destroyed => return Err(self.destroyed_error()),
            _ => {}
        }
        self.set_status(DeviceStatus::Starting);
        let ctx = self.context();
        match guarded(core.driver.start(&core.config, &ctx)).await {
            Ok(()) => {
                self.set_status(DeviceStatus::Running);
                info!(device = %ctx.full_name(), "device started");
                Ok(())
            }
            Err(e) => {
                warn!(device = %ctx.full_name(), error = %e, "device failed to start");
                self.set_status(DeviceStatus::Stopped);
                Err(e)
            }
        }
    }

    async fn stop_gated(&self, core: &mut DeviceCore<D>) -> Result<(), CoreError> {
        match self.status() {
            DeviceStatus::Stopped => return Ok(()),
            DeviceStatus::Destroyed => return Err(self.destroyed_error()),
            _ => {}
        }
        self.set_status(DeviceStatus::Stopping);
        let ctx = self.context();
        let result = guarded(core.driver.stop(&core.config, &ctx)).await;
        self.set_status(DeviceStatus::Stopped);
        match &result {
            Ok(()) => info!(device = %ctx.full_name(), "device stopped"),
            Err(e) => warn!(device = %ctx.full_name(), error = %e, "device stop hook failed"),
        }
        result
    }

    async fn reconfigure_gated(
        &self,
        core: &mut DeviceCore<D>,
        next: &D::Config,
    ) -> Result<ReconfigureOutcome, CoreError> {
        if self.status().is_destroyed() {
            return Err(self.destroyed_error());
        }
        validate_configuration(next)?;
        if next.name() != &*self.name {
            return Err(CoreError::invalid(
                &*self.name,
                format!("device name cannot change to '{}'", next.name()),
            ));
        }
        if next.kind() != core.config.kind() {
            return Err(CoreError::invalid(
                &*self.name,
                format!(
                    "configuration kind cannot change from '{}' to '{}'",
                    core.config.kind(),
                    next.kind()
                ),
            ));
        }

        let candidate = next.clone();
        let ctx = self.context();
        let outcome = guarded(core.driver.reconfigure(&core.config, &candidate, &ctx)).await?;
        if outcome == ReconfigureOutcome::RestartRequired {
            debug!(device = %ctx.full_name(), "reconfiguration requires a restart");
            return Ok(outcome);
        }

        let previous_policy = core.config.status();
        self.published.store(Arc::new(candidate.clone()));
        core.config = candidate;
        if outcome == ReconfigureOutcome::Updated {
            self.events
                .emit(ctx.full_name(), LifetimeEventKind::ConfigurationChanged);
        }
        if previous_policy != core.config.status() {
            self.notify_host(self.status());
        }
        debug!(device = %ctx.full_name(), %outcome, "device reconfigured");
        Ok(outcome)
    }

    async fn destroy_gated(&self, core: &mut DeviceCore<D>) -> Result<(), CoreError> {
        if self.status().is_destroyed() {
            return Ok(());
        }
        let ctx = self.context();
        if self.status() != DeviceStatus::Stopped {
            // Stop errors are already logged by stop_gated.
            let _ = self.stop_gated(core).await;
        }
        if let Err(e) = guarded(core.driver.destroy(&core.config, &ctx)).await {
            warn!(device = %ctx.full_name(), error = %e, "device teardown failed");
        }
        self.set_status(DeviceStatus::Destroyed);
        self.destroyed.cancel();
        info!(device = %ctx.full_name(), "device destroyed");
        Ok(())
    }

    fn replace_controller_key(
        &self,
        key: Option<String>,
        presented: Option<&str>,
    ) -> Result<(), CoreError> {
        if self.status().is_destroyed() {
            return Err(self.destroyed_error());
        }
        let current = self.controller_key.load_full();
        if let Some(current) = current.as_deref() {
            if presented != Some(current.as_str()) {
                return Err(self.key_mismatch());
            }
        }
        let changed = current.as_deref() != key.as_ref();
        let key_set = key.is_some();
        self.controller_key.store(key.map(Arc::new));
        if changed {
            self.events.emit(
                &self.full_name(),
                LifetimeEventKind::ControllerKeyChanged { key_set },
            );
        }
        Ok(())
    }

    /// Stop after a driver-reported fault. Takes the host lock like any
    /// other structural stop.
    async fn fault(&self, reason: &str) {
        let _host = match self.host.get() {
            Some(host) => Some(Arc::clone(&host.lock).lock_owned().await),
            None => None,
        };
        let mut core = self.core.lock().await;
        if !self.status().is_running() {
            debug!(device = %self.full_name(), reason, "fault reported while not running");
            return;
        }
        warn!(device = %self.full_name(), reason, "device fault, stopping");
        let _ = self.stop_gated(&mut core).await;
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Name and driver-level checks applied before any configuration is
/// accepted.
pub(crate) fn validate_configuration<C: DeviceConfiguration>(config: &C) -> Result<(), CoreError> {
    if config.name().trim().is_empty() {
        return Err(CoreError::invalid("<unnamed>", "device name must not be empty"));
    }
    config.validate().map_err(|e| match e {
        e @ CoreError::InvalidConfiguration { .. } => e,
        other => CoreError::invalid(config.name(), other.to_string()),
    })
}

/// Run a driver hook, turning a panic into an error.
async fn guarded<T>(hook: impl Future<Output = Result<T, CoreError>>) -> Result<T, CoreError> {
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(CoreError::Internal(format!(
            "driver hook panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
