// ── Device driver contract ──
//
// A driver supplies the device-specific hooks; `Device<D>` supplies the
// queue, state machine and configuration slot around it. Hooks run one
// at a time under the device's execution gate, so a driver can keep its
// state in plain fields behind `&mut self`.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::model::DeviceConfiguration;

/// What a driver did with a new configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ReconfigureOutcome {
    /// The new configuration is in effect.
    Updated,
    /// Nothing material changed for the driver; the new configuration is
    /// still stored.
    Unchanged,
    /// The driver cannot apply this while running. Nothing was applied;
    /// the caller must stop, reconfigure, then start.
    RestartRequired,
}

/// Device-specific behavior injected into a [`Device`](super::Device).
pub trait DeviceDriver: Send + 'static {
    type Config: DeviceConfiguration;
    type Command: Send + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Bring the device up. On error the device stays `Stopped`.
    fn start(
        &mut self,
        config: &Self::Config,
        ctx: &DeviceContext,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    /// Bring the device down. The device ends `Stopped` even on error.
    fn stop(
        &mut self,
        config: &Self::Config,
        ctx: &DeviceContext,
    ) -> impl Future<Output = Result<(), CoreError>> + Send;

    /// Inspect a validated replacement configuration.
    fn reconfigure(
        &mut self,
        current: &Self::Config,
        next: &Self::Config,
        ctx: &DeviceContext,
    ) -> impl Future<Output = Result<ReconfigureOutcome, CoreError>> + Send {
        let _ = (current, next, ctx);
        async { Ok(ReconfigureOutcome::Updated) }
    }

    /// Irreversible teardown. Errors are logged and swallowed.
    fn destroy(
        &mut self,
        config: &Self::Config,
        ctx: &DeviceContext,
    ) -> impl Future<Output = Result<(), CoreError>> + Send {
        let _ = (config, ctx);
        async { Ok(()) }
    }

    /// Execute one queued command. `cancel` is advisory.
    fn handle(
        &mut self,
        config: &Self::Config,
        ctx: &DeviceContext,
        command: Self::Command,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Self::Output, CoreError>> + Send;
}

/// Requests a driver can raise toward its own device. Processed by the
/// command loop between commands, never while a hook is running.
#[derive(Debug)]
pub(crate) enum DeviceSignal {
    Fault(String),
    AutoDestroy,
}

/// Handle given to driver hooks.
///
/// Cheap to clone; drivers may keep one in background tasks to report
/// faults after the hook has returned.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    name: Arc<str>,
    full_name: Arc<str>,
    signals: mpsc::UnboundedSender<DeviceSignal>,
}

impl DeviceContext {
    pub(crate) fn new(
        name: Arc<str>,
        full_name: Arc<str>,
        signals: mpsc::UnboundedSender<DeviceSignal>,
    ) -> Self {
        Self {
            name,
            full_name,
            signals,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Report that the underlying resource failed. The device is stopped
    /// after the current command; an AlwaysRunning device is then picked
    /// up by the daemon.
    pub fn report_fault(&self, reason: impl Into<String>) -> bool {
        self.signals.send(DeviceSignal::Fault(reason.into())).is_ok()
    }

    /// Ask for this device to be destroyed and removed from its host.
    pub fn request_auto_destroy(&self) -> bool {
        self.signals.send(DeviceSignal::AutoDestroy).is_ok()
    }
}
