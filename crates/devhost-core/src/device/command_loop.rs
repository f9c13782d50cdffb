// ── Per-device command loop ──
//
// One task per device. Pulls commands in FIFO order and executes them
// under the execution gate, parks WaitForNextStart commands until the
// device is running again, and handles driver signals between commands.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DeviceDriver, DeviceInner, DeviceSignal, guarded};
use crate::command::Command;
use crate::error::CoreError;
use crate::model::{DeviceStatus, StoppedBehavior};

type QueuedCommand<D> = Command<<D as DeviceDriver>::Command, <D as DeviceDriver>::Output>;

pub(super) async fn run<D: DeviceDriver>(
    device: Weak<DeviceInner<D>>,
    name: Arc<str>,
    mut commands: mpsc::UnboundedReceiver<QueuedCommand<D>>,
    mut signals: mpsc::UnboundedReceiver<DeviceSignal>,
    mut status: watch::Receiver<DeviceStatus>,
    destroyed: CancellationToken,
) {
    let mut deferred: VecDeque<QueuedCommand<D>> = VecDeque::new();
    debug!(device = %name, "command loop started");

    loop {
        if !deferred.is_empty() && status.borrow_and_update().is_running() {
            let Some(inner) = device.upgrade() else {
                break;
            };
            debug!(device = %name, count = deferred.len(), "replaying deferred commands");
            let replay = std::mem::take(&mut deferred);
            for command in replay {
                process(&inner, command, &mut deferred, true).await;
            }
            continue;
        }

        tokio::select! {
            biased;

            () = destroyed.cancelled() => break,

            Some(signal) = signals.recv() => {
                let Some(inner) = device.upgrade() else {
                    break;
                };
                handle_signal(&inner, signal).await;
            }

            Ok(()) = status.changed() => {}

            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match device.upgrade() {
                    Some(inner) => process(&inner, command, &mut deferred, false).await,
                    None => {
                        command.settle(Err(destroyed_error(&name)));
                    }
                }
            }
        }
    }

    // Fail everything still waiting.
    commands.close();
    let mut failed = 0usize;
    while let Ok(command) = commands.try_recv() {
        command.settle(Err(destroyed_error(&name)));
        failed += 1;
    }
    for command in deferred.drain(..) {
        command.settle(Err(destroyed_error(&name)));
        failed += 1;
    }
    debug!(device = %name, failed, "command loop stopped");
}

fn destroyed_error(name: &str) -> CoreError {
    CoreError::DeviceDestroyed {
        device: name.to_owned(),
    }
}

async fn handle_signal<D: DeviceDriver>(inner: &DeviceInner<D>, signal: DeviceSignal) {
    match signal {
        DeviceSignal::Fault(reason) => inner.fault(&reason).await,
        DeviceSignal::AutoDestroy => {
            debug!(device = %inner.full_name(), "auto-destroy requested");
            if let Some(device) = inner.handle() {
                // Goes through the host lock; the host drops the device
                // from its registry when it reaches Destroyed.
                let _ = device.destroy().await;
            }
        }
    }
}

/// Run one command through the admission checks and, if admitted, the
/// driver handler. `replaying` marks commands coming off the deferred
/// queue; fresh commands queue behind any still-deferred ones.
async fn process<D: DeviceDriver>(
    inner: &DeviceInner<D>,
    command: QueuedCommand<D>,
    deferred: &mut VecDeque<QueuedCommand<D>>,
    replaying: bool,
) {
    if command.is_canceled() {
        command.settle(Err(CoreError::Canceled));
        return;
    }
    if !inner.key_accepts(command.required_key()) {
        command.settle(Err(inner.key_mismatch()));
        return;
    }

    let mut core = inner.core.lock().await;
    let status = inner.status();
    if status.is_destroyed() {
        command.settle(Err(inner.destroyed_error()));
        return;
    }

    let behavior = command.behavior();
    if status.is_running() {
        if !replaying && !deferred.is_empty() {
            deferred.push_back(command);
            return;
        }
    } else {
        match behavior {
            StoppedBehavior::RunAnyway => {}
            StoppedBehavior::FailImmediately => {
                command.settle(Err(CoreError::DeviceNotRunning {
                    device: inner.full_name().to_string(),
                }));
                return;
            }
            StoppedBehavior::Cancel => {
                command.settle(Err(CoreError::Canceled));
                return;
            }
            StoppedBehavior::WaitForNextStart => {
                debug!(device = %inner.full_name(), %status, "deferring command until next start");
                deferred.push_back(command);
                return;
            }
        }
    }

    let (payload, cancel, completion) = command.into_parts();
    // RunAnyway only honours cancellation before dispatch.
    let cancel = match behavior {
        StoppedBehavior::RunAnyway => CancellationToken::new(),
        _ => cancel,
    };
    let ctx = inner.context();
    let core = &mut *core;
    let result = guarded(core.driver.handle(&core.config, &ctx, payload, cancel)).await;
    if let Err(e) = &result {
        if !e.is_canceled() {
            warn!(device = %ctx.full_name(), error = %e, "command handler failed");
        }
    }
    completion.try_set(result);
}
