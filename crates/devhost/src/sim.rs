//! Simulated sensor devices.
//!
//! Each running sensor produces a reading every `interval_ms` and raises it
//! into an [`ActiveEventLoop`] that logs it, so the command loop is never
//! blocked by the producer. `fail_starts` and `fault_after_ms` let a
//! configuration file exercise the daemon's restart path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use devhost_core::{
    ActiveEventLoop, ConfigurationStatus, CoreError, DeviceConfiguration, DeviceContext,
    DeviceDriver, DeviceFactories, ReconfigureOutcome,
};

/// Device type registered for [`SensorConfiguration`].
pub const SENSOR_TYPE: &str = "sim::Sensor";

fn default_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfiguration {
    pub name: String,

    #[serde(default)]
    pub status: ConfigurationStatus,

    /// Time between readings.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Added to every reading; applied live.
    #[serde(default)]
    pub offset: f64,

    /// Reject this many start attempts before coming up.
    #[serde(default)]
    pub fail_starts: u32,

    /// Report a fault this long after each start.
    #[serde(default)]
    pub fault_after_ms: Option<u64>,
}

impl DeviceConfiguration for SensorConfiguration {
    fn kind(&self) -> &str {
        "sim::SensorConfiguration"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ConfigurationStatus {
        self.status
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.interval_ms == 0 {
            return Err(CoreError::invalid(&self.name, "interval_ms must be positive"));
        }
        if !self.offset.is_finite() {
            return Err(CoreError::invalid(&self.name, "offset must be finite"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum SensorCommand {
    /// Latest reading including the configured offset.
    Read,
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    sequence: u64,
    value: f64,
}

/// State shared between the driver and its ticker task.
#[derive(Debug, Default)]
struct Latest {
    sequence: AtomicU64,
    value_bits: AtomicU64,
}

impl Latest {
    fn store(&self, reading: Reading) {
        self.value_bits.store(reading.value.to_bits(), Ordering::Relaxed);
        self.sequence.store(reading.sequence, Ordering::Release);
    }

    fn value(&self) -> Option<f64> {
        if self.sequence.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(f64::from_bits(self.value_bits.load(Ordering::Relaxed)))
    }
}

#[derive(Debug, Default)]
pub struct SensorDriver {
    start_attempts: u32,
    latest: Arc<Latest>,
    ticker: Option<CancellationToken>,
    readings: Option<ActiveEventLoop<Reading>>,
}

impl SensorDriver {
    async fn halt(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel();
        }
        if let Some(readings) = self.readings.take() {
            readings.shutdown().await;
        }
    }
}

/// Factories for every simulated device type.
pub fn factories() -> DeviceFactories<SensorDriver> {
    DeviceFactories::new().with(SENSOR_TYPE, |_: &SensorConfiguration| Ok(SensorDriver::default()))
}

/// Deterministic waveform so repeated runs print the same values.
fn sample(sequence: u64) -> f64 {
    let step = u32::try_from(sequence % 24).unwrap_or(0);
    20.0 + (f64::from(step) * std::f64::consts::PI / 12.0).sin() * 5.0
}

impl DeviceDriver for SensorDriver {
    type Config = SensorConfiguration;
    type Command = SensorCommand;
    type Output = f64;

    async fn start(&mut self, config: &SensorConfiguration, ctx: &DeviceContext) -> Result<(), CoreError> {
        self.start_attempts = self.start_attempts.saturating_add(1);
        if self.start_attempts <= config.fail_starts {
            return Err(CoreError::failed(format!(
                "simulated start failure {}/{}",
                self.start_attempts, config.fail_starts
            )));
        }

        let device = ctx.full_name().to_owned();
        let latest = Arc::clone(&self.latest);
        let readings = ActiveEventLoop::spawn(format!("{device}.readings"), move |reading: Reading| {
            let latest = Arc::clone(&latest);
            let device = device.clone();
            async move {
                latest.store(reading);
                debug!(device = %device, sequence = reading.sequence, value = reading.value, "reading");
                Ok(())
            }
        });

        let ticker = CancellationToken::new();
        tokio::spawn(tick(
            readings.sender(),
            ticker.clone(),
            ctx.clone(),
            Duration::from_millis(config.interval_ms),
            config.fault_after_ms.map(Duration::from_millis),
        ));

        self.ticker = Some(ticker);
        self.readings = Some(readings);
        info!(device = %ctx.full_name(), interval_ms = config.interval_ms, "sensor started");
        Ok(())
    }

    async fn stop(&mut self, _config: &SensorConfiguration, ctx: &DeviceContext) -> Result<(), CoreError> {
        self.halt().await;
        info!(device = %ctx.full_name(), "sensor stopped");
        Ok(())
    }

    async fn reconfigure(
        &mut self,
        current: &SensorConfiguration,
        next: &SensorConfiguration,
        _ctx: &DeviceContext,
    ) -> Result<ReconfigureOutcome, CoreError> {
        if current == next {
            return Ok(ReconfigureOutcome::Unchanged);
        }
        // The ticker owns its interval and fault timer.
        let timing_changed = current.interval_ms != next.interval_ms
            || current.fault_after_ms != next.fault_after_ms;
        if timing_changed && self.ticker.is_some() {
            return Ok(ReconfigureOutcome::RestartRequired);
        }
        Ok(ReconfigureOutcome::Updated)
    }

    async fn destroy(&mut self, _config: &SensorConfiguration, _ctx: &DeviceContext) -> Result<(), CoreError> {
        self.halt().await;
        Ok(())
    }

    async fn handle(
        &mut self,
        config: &SensorConfiguration,
        ctx: &DeviceContext,
        command: SensorCommand,
        _cancel: CancellationToken,
    ) -> Result<f64, CoreError> {
        match command {
            SensorCommand::Read => self
                .latest
                .value()
                .map(|value| value + config.offset)
                .ok_or_else(|| CoreError::failed(format!("{} has no reading yet", ctx.full_name()))),
        }
    }
}

async fn tick(
    readings: devhost_core::ActiveEventSender<Reading>,
    stop: CancellationToken,
    ctx: DeviceContext,
    interval: Duration,
    fault_after: Option<Duration>,
) {
    let mut interval = tokio::time::interval(interval);
    let fault_at = fault_after.map(|after| tokio::time::Instant::now() + after);
    let mut sequence = 0u64;

    loop {
        let fault = async {
            match fault_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = fault => {
                ctx.report_fault("simulated fault");
                break;
            }
            _ = interval.tick() => {
                sequence += 1;
                let reading = Reading { sequence, value: sample(sequence) };
                if !readings.raise(reading) {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use devhost_core::{ConfigurationSnapshot, DeviceHost, DeviceStatus};

    use super::*;

    fn sensor(name: &str) -> SensorConfiguration {
        SensorConfiguration {
            name: name.into(),
            status: ConfigurationStatus::RunnableStarted,
            interval_ms: 100,
            offset: 0.5,
            fail_starts: 0,
            fault_after_ms: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reads_latest_value_with_offset() {
        let host = DeviceHost::new("lab", factories());
        host.apply_configuration(ConfigurationSnapshot::full(vec![sensor("probe")]), false)
            .await
            .unwrap();
        let probe = host.get("probe").unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let value = probe.execute(SensorCommand::Read).await.unwrap();
        assert!((value - (sample(3) + 0.5)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_stops_the_sensor() {
        let mut config = sensor("probe");
        config.fault_after_ms = Some(300);
        let host = DeviceHost::new("lab", factories());
        host.apply_configuration(ConfigurationSnapshot::full(vec![config]), false)
            .await
            .unwrap();
        let started = tokio::time::Instant::now();
        let probe = host.get("probe").unwrap();
        let mut status = probe.status_watch();

        status.wait_for(|s| *s == DeviceStatus::Stopped).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = sensor("probe");
        config.interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn timing_change_needs_restart_while_running() {
        let host = DeviceHost::new("lab", factories());
        host.apply_configuration(ConfigurationSnapshot::full(vec![sensor("probe")]), false)
            .await
            .unwrap();
        let probe = host.get("probe").unwrap();

        let mut slower = sensor("probe");
        slower.interval_ms = 500;
        assert_eq!(
            probe.reconfigure(&slower).await.unwrap(),
            ReconfigureOutcome::RestartRequired
        );

        let mut shifted = sensor("probe");
        shifted.offset = 2.0;
        assert_eq!(
            probe.reconfigure(&shifted).await.unwrap(),
            ReconfigureOutcome::Updated
        );
        assert!((probe.configuration().offset - 2.0).abs() < f64::EPSILON);
    }
}
