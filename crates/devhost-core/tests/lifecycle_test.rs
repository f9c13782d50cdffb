#![allow(clippy::unwrap_used)]
// Integration tests for the public devhost-core surface: command
// ordering, destruction, configuration apply and daemon recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use devhost_core::{
    ApplyOutcome, Command, ConfigurationSnapshot, ConfigurationStatus, CoreError, DaemonConfig,
    Device, DeviceConfiguration, DeviceContext, DeviceDriver, DeviceFactories, DeviceHost,
    DeviceHostDaemon, DeviceStatus, decode_configuration, encode_configuration,
};

// ── Test driver ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ValveConfiguration {
    name: String,
    status: ConfigurationStatus,
    #[serde(default)]
    flow_rate: u16,
    #[serde(default)]
    tags: Vec<String>,
}

impl ValveConfiguration {
    fn new(name: &str, status: ConfigurationStatus) -> Self {
        Self {
            name: name.to_owned(),
            status,
            flow_rate: 10,
            tags: Vec::new(),
        }
    }
}

impl DeviceConfiguration for ValveConfiguration {
    fn kind(&self) -> &str {
        "plumbing::ValveConfiguration"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ConfigurationStatus {
        self.status
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.flow_rate == 0 {
            return Err(CoreError::invalid(&self.name, "flow rate must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Journal {
    handled: Mutex<Vec<(usize, usize)>>,
    starts: AtomicUsize,
}

struct ValveDriver {
    journal: Arc<Journal>,
}

impl DeviceDriver for ValveDriver {
    type Config = ValveConfiguration;
    type Command = (usize, usize);
    type Output = usize;

    async fn start(&mut self, _config: &ValveConfiguration, _ctx: &DeviceContext) -> Result<(), CoreError> {
        self.journal.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self, _config: &ValveConfiguration, _ctx: &DeviceContext) -> Result<(), CoreError> {
        Ok(())
    }

    async fn handle(
        &mut self,
        _config: &ValveConfiguration,
        _ctx: &DeviceContext,
        command: (usize, usize),
        _cancel: CancellationToken,
    ) -> Result<usize, CoreError> {
        tokio::task::yield_now().await;
        self.journal.handled.lock().unwrap().push(command);
        Ok(command.1)
    }
}

fn valve_host(journal: &Arc<Journal>) -> DeviceHost<ValveDriver> {
    let journal = Arc::clone(journal);
    DeviceHost::new(
        "irrigation",
        DeviceFactories::new().with("plumbing::Valve", move |_: &ValveConfiguration| {
            Ok(ValveDriver {
                journal: Arc::clone(&journal),
            })
        }),
    )
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_keep_per_producer_order() {
    let journal = Arc::new(Journal::default());
    let device = Device::new(
        ValveDriver {
            journal: Arc::clone(&journal),
        },
        &ValveConfiguration::new("main", ConfigurationStatus::Runnable),
    )
    .unwrap();
    device.start().await.unwrap();

    let mut producers = Vec::new();
    for producer in 0..4 {
        let device = device.clone();
        producers.push(tokio::spawn(async move {
            let mut completions = Vec::new();
            for seq in 0..25 {
                let command = Command::new("main", (producer, seq));
                completions.push(command.completion());
                assert!(device.send_command(command));
            }
            for (seq, completion) in completions.into_iter().enumerate() {
                assert_eq!(completion.await.unwrap(), seq);
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let handled = journal.handled.lock().unwrap().clone();
    assert_eq!(handled.len(), 100);
    for producer in 0..4 {
        let seqs: Vec<usize> = handled
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(seqs, (0..25).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn send_after_destroy_is_rejected() {
    let journal = Arc::new(Journal::default());
    let host = valve_host(&journal);
    host.apply_configuration(
        ConfigurationSnapshot::full(vec![ValveConfiguration::new(
            "main",
            ConfigurationStatus::RunnableStarted,
        )]),
        false,
    )
    .await
    .unwrap();
    let valve = host.get("main").unwrap();

    host.destroy_device("main").await.unwrap();
    assert_eq!(valve.status(), DeviceStatus::Destroyed);

    let command = Command::new("main", (0, 1));
    let completion = command.completion();
    assert!(!valve.send_command(command));
    assert!(matches!(
        completion.await,
        Err(CoreError::DeviceDestroyed { .. })
    ));
    assert!(journal.handled.lock().unwrap().is_empty());
    assert!(host.find("main").is_none());
}

#[tokio::test]
async fn precancelled_command_completes_canceled() {
    let journal = Arc::new(Journal::default());
    let device = Device::new(
        ValveDriver {
            journal: Arc::clone(&journal),
        },
        &ValveConfiguration::new("main", ConfigurationStatus::Runnable),
    )
    .unwrap();
    device.start().await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let command = Command::new("main", (0, 7)).cancel_token(token);
    let completion = command.completion();
    assert!(device.send_command(command));

    assert_eq!(completion.await, Err(CoreError::Canceled));
    assert!(journal.handled.lock().unwrap().is_empty());
}

// ── Configuration apply ─────────────────────────────────────────────

#[tokio::test]
async fn duplicate_names_leave_existing_devices_unchanged() {
    let journal = Arc::new(Journal::default());
    let host = valve_host(&journal);
    host.apply_configuration(
        ConfigurationSnapshot::full(vec![ValveConfiguration::new(
            "main",
            ConfigurationStatus::RunnableStarted,
        )]),
        false,
    )
    .await
    .unwrap();

    let mut changed = ValveConfiguration::new("main", ConfigurationStatus::Disabled);
    changed.flow_rate = 40;
    let err = host
        .apply_configuration(
            ConfigurationSnapshot::full(vec![
                changed,
                ValveConfiguration::new("garden", ConfigurationStatus::Runnable),
                ValveConfiguration::new("garden", ConfigurationStatus::Runnable),
            ]),
            false,
        )
        .await
        .unwrap_err();

    assert_eq!(err, CoreError::DuplicateDevice { name: "garden".into() });
    assert_eq!(host.device_names(), vec!["main"]);
    let main = host.get("main").unwrap();
    assert_eq!(main.status(), DeviceStatus::Running);
    assert_eq!(main.configuration().flow_rate, 10);
}

#[tokio::test]
async fn partial_and_full_apply_differ_on_omitted_devices() {
    let journal = Arc::new(Journal::default());
    let host = valve_host(&journal);
    host.apply_configuration(
        ConfigurationSnapshot::full(vec![
            ValveConfiguration::new("main", ConfigurationStatus::RunnableStarted),
            ValveConfiguration::new("garden", ConfigurationStatus::RunnableStarted),
        ]),
        false,
    )
    .await
    .unwrap();
    let garden = host.get("garden").unwrap();

    let report = host
        .apply_configuration(
            ConfigurationSnapshot::partial(vec![ValveConfiguration::new(
                "main",
                ConfigurationStatus::RunnableStarted,
            )]),
            false,
        )
        .await
        .unwrap();
    assert_eq!(report.unconfigured, vec!["garden"]);
    assert_eq!(garden.status(), DeviceStatus::Running);

    let report = host
        .apply_configuration(
            ConfigurationSnapshot::full(vec![ValveConfiguration::new(
                "main",
                ConfigurationStatus::RunnableStarted,
            )]),
            false,
        )
        .await
        .unwrap();
    assert_eq!(report.destroyed, vec!["garden"]);
    assert_eq!(report.outcome("main"), Some(ApplyOutcome::Updated));
    assert_eq!(garden.status(), DeviceStatus::Destroyed);
    assert_eq!(host.device_names(), vec!["main"]);
}

#[tokio::test]
async fn invalid_reconfigure_keeps_previous_configuration() {
    let journal = Arc::new(Journal::default());
    let host = valve_host(&journal);
    host.apply_configuration(
        ConfigurationSnapshot::full(vec![ValveConfiguration::new(
            "main",
            ConfigurationStatus::RunnableStarted,
        )]),
        false,
    )
    .await
    .unwrap();
    let main = host.get("main").unwrap();

    let mut broken = main.configuration();
    broken.flow_rate = 0;
    let err = main.reconfigure(&broken).await.unwrap_err();

    assert!(matches!(err, CoreError::InvalidConfiguration { .. }));
    assert_eq!(main.configuration().flow_rate, 10);
    assert_eq!(main.status(), DeviceStatus::Running);
}

// ── Daemon ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn daemon_restarts_always_running_device() {
    let journal = Arc::new(Journal::default());
    let daemon = DeviceHostDaemon::new(DaemonConfig::default());
    daemon.start().unwrap();
    let host = valve_host(&journal);
    daemon.register(&host);
    host.apply_configuration(
        ConfigurationSnapshot::full(vec![ValveConfiguration::new(
            "main",
            ConfigurationStatus::AlwaysRunning,
        )]),
        false,
    )
    .await
    .unwrap();

    let main = host.get("main").unwrap();
    let mut status = main.status_watch();
    main.stop().await.unwrap();

    tokio::time::timeout(
        Duration::from_millis(250),
        status.wait_for(|s| *s == DeviceStatus::Running),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(journal.starts.load(Ordering::SeqCst), 2);

    daemon.shutdown(devhost_core::StopBehavior::StopDevicesAndWait).await;
    assert_eq!(main.status(), DeviceStatus::Destroyed);
}

// ── Codec ───────────────────────────────────────────────────────────

#[test]
fn configuration_survives_encode_decode_of_a_copy() {
    let mut original = ValveConfiguration::new("main", ConfigurationStatus::AlwaysRunning);
    original.tags = vec!["north".into(), "drip".into()];

    let copy = original.clone();
    let decoded: ValveConfiguration = decode_configuration(&encode_configuration(&copy).unwrap()).unwrap();

    assert_eq!(decoded, original);
}
