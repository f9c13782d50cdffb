// ── Test fixtures shared by unit tests ──
//
// A lamp driver that records every hook it sees and flags overlapping
// handler invocations.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceContext, DeviceDriver, ReconfigureOutcome};
use crate::error::CoreError;
use crate::model::{ConfigurationStatus, DeviceConfiguration};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LampConfiguration {
    pub name: String,
    #[serde(default)]
    pub status: ConfigurationStatus,
    #[serde(default)]
    pub brightness: u8,
    /// Brightness changes need a restart when set.
    #[serde(default)]
    pub restart_on_change: bool,
}

impl LampConfiguration {
    pub fn new(name: &str, status: ConfigurationStatus) -> Self {
        Self {
            name: name.to_owned(),
            status,
            brightness: 50,
            restart_on_change: false,
        }
    }

    pub fn brightness(mut self, brightness: u8) -> Self {
        self.brightness = brightness;
        self
    }
}

impl DeviceConfiguration for LampConfiguration {
    fn kind(&self) -> &str {
        "test::LampConfiguration"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ConfigurationStatus {
        self.status
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.brightness > 100 {
            return Err(CoreError::invalid(&self.name, "brightness above 100"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum LampCommand {
    Echo(u32),
    Sleep(Duration),
    Fail(&'static str),
    Panic,
    Brightness,
    Fault,
    AutoDestroy,
    WaitCancel,
}

/// Shared observation point between a test and its driver.
#[derive(Debug, Default)]
pub(crate) struct Probe {
    log: Mutex<Vec<String>>,
    active: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub starts: AtomicUsize,
}

impl Probe {
    pub fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }
}

struct ActiveGuard<'a>(&'a Probe);

impl<'a> ActiveGuard<'a> {
    fn enter(probe: &'a Probe) -> Self {
        if probe.active.fetch_add(1, Ordering::SeqCst) > 0 {
            probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        Self(probe)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct LampDriver {
    pub probe: Arc<Probe>,
}

impl LampDriver {
    pub fn new(probe: &Arc<Probe>) -> Self {
        Self {
            probe: Arc::clone(probe),
        }
    }
}

impl DeviceDriver for LampDriver {
    type Config = LampConfiguration;
    type Command = LampCommand;
    type Output = u32;

    async fn start(&mut self, config: &LampConfiguration, _ctx: &DeviceContext) -> Result<(), CoreError> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_start.load(Ordering::SeqCst) {
            self.probe.record(format!("start-failed:{}", config.name));
            return Err(CoreError::failed("bulb missing"));
        }
        self.probe.record(format!("start:{}", config.name));
        Ok(())
    }

    async fn stop(&mut self, config: &LampConfiguration, _ctx: &DeviceContext) -> Result<(), CoreError> {
        self.probe.record(format!("stop:{}", config.name));
        if self.probe.fail_stop.load(Ordering::SeqCst) {
            return Err(CoreError::failed("switch stuck"));
        }
        Ok(())
    }

    async fn reconfigure(
        &mut self,
        current: &LampConfiguration,
        next: &LampConfiguration,
        _ctx: &DeviceContext,
    ) -> Result<ReconfigureOutcome, CoreError> {
        if current.brightness == next.brightness && current.status == next.status {
            return Ok(ReconfigureOutcome::Unchanged);
        }
        if next.restart_on_change && current.brightness != next.brightness {
            return Ok(ReconfigureOutcome::RestartRequired);
        }
        self.probe.record(format!("reconfigure:{}", next.name));
        Ok(ReconfigureOutcome::Updated)
    }

    async fn destroy(&mut self, config: &LampConfiguration, _ctx: &DeviceContext) -> Result<(), CoreError> {
        self.probe.record(format!("destroy:{}", config.name));
        Ok(())
    }

    async fn handle(
        &mut self,
        config: &LampConfiguration,
        ctx: &DeviceContext,
        command: LampCommand,
        cancel: CancellationToken,
    ) -> Result<u32, CoreError> {
        let _active = ActiveGuard::enter(&self.probe);
        match command {
            LampCommand::Echo(value) => {
                self.probe.record(format!("echo:{value}"));
                Ok(value)
            }
            LampCommand::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(0)
            }
            LampCommand::Fail(message) => Err(CoreError::failed(message)),
            LampCommand::Panic => panic!("filament snapped"),
            LampCommand::Brightness => Ok(u32::from(config.brightness)),
            LampCommand::Fault => {
                ctx.report_fault("bulb blew");
                Ok(0)
            }
            LampCommand::AutoDestroy => {
                ctx.request_auto_destroy();
                Ok(0)
            }
            LampCommand::WaitCancel => {
                cancel.cancelled().await;
                Err(CoreError::Canceled)
            }
        }
    }
}

/// Let spawned tasks run until they block.
pub(crate) async fn settle_tasks() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
