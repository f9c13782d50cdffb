//! `devhost run`: apply the configured hosts under the daemon and wait.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use devhost_core::{ApplyReport, DeviceHost, DeviceHostDaemon, LifetimeStream, StopBehavior};

use crate::cli::{GlobalOpts, OutputFormat, RunArgs};
use crate::commands::DeviceRow;
use crate::config::{self, Config};
use crate::error::CliError;
use crate::output;
use crate::sim::{self, SensorCommand, SensorConfiguration, SensorDriver};

pub async fn handle(args: &RunArgs, config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let selected = config::select_hosts(config, &args.hosts)?;

    let daemon = DeviceHostDaemon::with_policy(config.daemon_config(), Arc::new(config.retry_policy()));
    daemon.start()?;

    let mut hosts = Vec::with_capacity(selected.len());
    let mut watchers = JoinSet::new();
    let mut rows = Vec::new();
    let color = matches!(global.output, OutputFormat::Table) && output::should_color(&global.color);

    for (name, section) in selected {
        let snapshot = match section.snapshot::<SensorConfiguration>(name) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                daemon.shutdown(StopBehavior::StopDevicesAndWait).await;
                return Err(e.into());
            }
        };

        let host = DeviceHost::new(name, sim::factories());
        daemon.register(&host);
        match host.apply_configuration(snapshot, section.allow_empty).await {
            Ok(report) => rows.extend(report_rows(&host, &report, color)),
            Err(e) => {
                daemon.shutdown(StopBehavior::StopDevicesAndWait).await;
                return Err(e.into());
            }
        }
        for device in host.devices() {
            watchers.spawn(watch_status(device.full_name(), device.subscribe().into_stream()));
        }
        hosts.push(host);
    }

    let out = output::render_list(&global.output, &rows, DeviceRow::clone, DeviceRow::id)?;
    output::print_output(&out, global.quiet);

    wait_for_exit(args.duration).await?;

    for host in &hosts {
        log_final_state(host).await;
    }
    daemon.stop().await;
    watchers.abort_all();
    Ok(())
}

fn report_rows(host: &DeviceHost<SensorDriver>, report: &ApplyReport, color: bool) -> Vec<DeviceRow> {
    report
        .items
        .iter()
        .map(|item| DeviceRow {
            host: host.name().to_owned(),
            device: item.name.clone(),
            policy: host
                .applied_configuration(&item.name)
                .map(|c| c.status.to_string())
                .unwrap_or_default(),
            result: output::paint(&item.outcome.to_string(), item.outcome.is_failure(), color),
            detail: item.error.as_ref().map(ToString::to_string).unwrap_or_default(),
        })
        .collect()
}

async fn wait_for_exit(duration: Option<u64>) -> Result<(), CliError> {
    match duration {
        Some(secs) => {
            info!(secs, "running for a fixed duration");
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        None => {
            info!("running until interrupted (Ctrl-C)");
            tokio::signal::ctrl_c().await?;
        }
    }
    Ok(())
}

/// Log every status transition the device goes through while running.
async fn watch_status(name: String, mut events: LifetimeStream) {
    while let Some(event) = events.next().await {
        if let Some((from, to)) = event.status_change() {
            info!(device = %name, sequence = event.sequence, %from, %to, "status changed");
        }
    }
}

async fn log_final_state(host: &DeviceHost<SensorDriver>) {
    for device in host.devices() {
        let status = device.status();
        if !status.is_running() {
            info!(device = %device.full_name(), %status, "final state");
            continue;
        }
        match device.execute(SensorCommand::Read).await {
            Ok(value) => info!(device = %device.full_name(), %status, value, "final state"),
            Err(e) => warn!(device = %device.full_name(), error = %e, "final read failed"),
        }
    }
}
