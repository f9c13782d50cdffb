// ── Device host daemon ──
//
// One background task supervising every registered host. It sleeps until
// the earliest tracked retry is due (or indefinitely when nothing is
// tracked), wakes early on tracker changes, and hands each due device
// to the retry policy.

mod policy;
mod signal;
mod supervised;

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use policy::{BackoffRetryPolicy, RetryContext, RetryPolicy};
pub use signal::DaemonSignal;
pub use supervised::{SupervisedDevice, SupervisedHost, TrackedDevice};

use crate::config::{DaemonConfig, StopBehavior};
use crate::device::DeviceDriver;
use crate::error::CoreError;
use crate::host::DeviceHost;

struct DaemonInner {
    config: DaemonConfig,
    policy: Arc<dyn RetryPolicy>,
    hosts: DashMap<String, Weak<dyn SupervisedHost>>,
    signal: DaemonSignal,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DaemonInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Restarts AlwaysRunning devices that are not running.
///
/// Cheaply cloneable. The loop runs from [`start`](Self::start) until
/// [`shutdown`](Self::shutdown) or until the last handle is dropped.
#[derive(Clone)]
pub struct DeviceHostDaemon {
    inner: Arc<DaemonInner>,
}

impl DeviceHostDaemon {
    /// A daemon using [`BackoffRetryPolicy`] built from `config.backoff`.
    pub fn new(config: DaemonConfig) -> Self {
        let policy = Arc::new(BackoffRetryPolicy::new(config.backoff.clone()));
        Self::with_policy(config, policy)
    }

    pub fn with_policy(config: DaemonConfig, policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                config,
                policy,
                hosts: DashMap::new(),
                signal: DaemonSignal::new(),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    /// Signal handed to hosts; exposed for custom [`SupervisedHost`]s.
    pub fn signal(&self) -> DaemonSignal {
        self.inner.signal.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
            && self
                .inner
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    /// Spawn the supervision loop. Fails after shutdown or if already started.
    pub fn start(&self) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::Internal("daemon has been shut down".into()));
        }
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(CoreError::Internal("daemon already started".into()));
        }
        *task = Some(tokio::spawn(run(
            Arc::downgrade(&self.inner),
            self.inner.cancel.clone(),
            self.inner.signal.clone(),
        )));
        Ok(())
    }

    // ── Host registration ────────────────────────────────────────────

    /// Supervise `host`. A host registered under the same name replaces
    /// the previous one.
    pub fn register<D: DeviceDriver>(&self, host: &DeviceHost<D>) {
        host.attach_daemon(self.inner.signal.clone());
        self.register_supervised(host.name(), host.supervised());
    }

    /// Supervise a custom host. The host must call
    /// [`signal().notify()`](DaemonSignal::notify) whenever its tracker changes.
    pub fn register_supervised(&self, name: &str, host: Weak<dyn SupervisedHost>) {
        self.inner.hosts.insert(name.to_owned(), host);
        debug!(host = name, "host registered with daemon");
        self.inner.signal.notify();
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.inner.hosts.remove(name).is_some();
        if removed {
            debug!(host = name, "host unregistered from daemon");
            self.inner.signal.notify();
        }
        removed
    }

    pub fn host_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.hosts.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// End the loop, then apply `behavior` to every registered host.
    pub async fn shutdown(&self, behavior: StopBehavior) {
        self.inner.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let hosts = self.inner.live_hosts();
        match behavior {
            StopBehavior::None => {}
            StopBehavior::StopDevices => {
                for host in hosts {
                    tokio::spawn(async move { host.clear().await });
                }
            }
            StopBehavior::StopDevicesAndWait => {
                join_all(hosts.iter().map(|host| host.clear())).await;
            }
        }
        info!(%behavior, "device host daemon shut down");
    }

    /// Shut down with the configured stop behavior.
    pub async fn stop(&self) {
        self.shutdown(self.inner.config.stop_behavior).await;
    }
}

impl std::fmt::Debug for DeviceHostDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHostDaemon")
            .field("hosts", &self.host_names())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ── Supervision loop ─────────────────────────────────────────────────

async fn run(daemon: Weak<DaemonInner>, cancel: CancellationToken, signal: DaemonSignal) {
    let mut wake = signal.subscribe();
    info!("device host daemon started");

    loop {
        // Mark the current generation seen before computing the deadline
        // so a tracker change after this point wakes the wait below.
        wake.borrow_and_update();
        let deadline = match daemon.upgrade() {
            Some(inner) => inner.next_deadline(),
            None => break,
        };

        match deadline {
            Some(at) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = wake.changed() => {}
                    () = sleep_until(at) => {}
                }
            }
            None => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = wake.changed() => {}
                }
            }
        }

        let Some(inner) = daemon.upgrade() else {
            break;
        };
        inner.tick().await;
    }

    info!("device host daemon stopped");
}

impl DaemonInner {
    fn live_hosts(&self) -> Vec<Arc<dyn SupervisedHost>> {
        self.hosts.retain(|_, host| host.strong_count() > 0);
        self.hosts.iter().filter_map(|e| e.value().upgrade()).collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.live_hosts()
            .iter()
            .filter_map(|host| host.next_retry_at())
            .min()
    }

    /// Run every due tracked device through the policy.
    ///
    /// Entries that are not yet due keep their retry count: the count
    /// advances only when the policy was actually consulted.
    async fn tick(&self) {
        let now = Instant::now();
        let ctx = RetryContext {
            now,
            shutdown: self.cancel.clone(),
        };

        for host in self.live_hosts() {
            for tracked in host.tracked() {
                if self.cancel.is_cancelled() {
                    return;
                }
                let device = tracked.device.as_ref();
                let name = device.name().to_owned();
                let status = device.status();
                if status.is_running() || status.is_destroyed() {
                    host.untrack(&name);
                    continue;
                }
                if tracked.next_attempt > now {
                    continue;
                }

                let next_count = tracked.retry_count.saturating_add(1);
                match self
                    .policy
                    .retry(&ctx, host.as_ref(), device, tracked.retry_count)
                    .await
                {
                    Ok(0) => {
                        host.untrack(&name);
                    }
                    Ok(delay_ms) => {
                        let at = Instant::now() + Duration::from_millis(delay_ms);
                        host.reschedule(&name, next_count, at);
                        debug!(
                            host = host.host_name(),
                            device = %name,
                            retry_count = next_count,
                            delay_ms,
                            "device restart rescheduled"
                        );
                    }
                    Err(e) => {
                        let error = CoreError::RetryPolicy {
                            device: device.full_name(),
                            message: e.to_string(),
                        };
                        error!(host = host.host_name(), device = %name, error = %error, "retry policy failed");
                        let at = Instant::now() + self.config.policy_failure_delay;
                        host.reschedule(&name, next_count, at);
                    }
                }
            }
        }
    }
}
