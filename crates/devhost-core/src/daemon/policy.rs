// ── Retry policies ──

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{SupervisedDevice, SupervisedHost};
use crate::config::{BackoffConfig, DEFAULT_BACKOFF_MS, ExhaustedBehavior};
use crate::error::CoreError;

/// Information about the current daemon pass handed to a policy.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// When the daemon woke for this pass.
    pub now: Instant,
    /// Cancelled when the daemon shuts down.
    pub shutdown: CancellationToken,
}

/// Decides what to do with a tracked device that is due.
///
/// Returns the delay in milliseconds before the next attempt; `0` ends
/// tracking. Errors are logged by the daemon, which retries the policy
/// after its failure delay.
pub trait RetryPolicy: Send + Sync {
    fn retry<'a>(
        &'a self,
        ctx: &'a RetryContext,
        host: &'a dyn SupervisedHost,
        device: &'a dyn SupervisedDevice,
        retry_count: u32,
    ) -> BoxFuture<'a, Result<u64, CoreError>>;
}

/// Start the device; on failure wait the next delay of the table.
#[derive(Debug, Clone)]
pub struct BackoffRetryPolicy {
    delays_ms: Vec<u64>,
    on_exhausted: ExhaustedBehavior,
}

impl Default for BackoffRetryPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl BackoffRetryPolicy {
    /// An empty delay table falls back to the default one.
    pub fn new(config: BackoffConfig) -> Self {
        let delays_ms = if config.delays_ms.is_empty() {
            DEFAULT_BACKOFF_MS.to_vec()
        } else {
            config.delays_ms
        };
        Self {
            delays_ms,
            on_exhausted: config.on_exhausted,
        }
    }

    pub fn delays_ms(&self) -> &[u64] {
        &self.delays_ms
    }

    /// Delay after the `retry_count`-th consecutive failure, `None` once
    /// the table is exhausted and the policy gives up.
    pub fn delay_for(&self, retry_count: u32) -> Option<u64> {
        let index = usize::try_from(retry_count).unwrap_or(usize::MAX);
        match self.delays_ms.get(index) {
            Some(delay) => Some(*delay),
            None => match self.on_exhausted {
                ExhaustedBehavior::GiveUp => None,
                ExhaustedBehavior::RetryForever => self.delays_ms.last().copied(),
            },
        }
    }
}

impl RetryPolicy for BackoffRetryPolicy {
    fn retry<'a>(
        &'a self,
        _ctx: &'a RetryContext,
        host: &'a dyn SupervisedHost,
        device: &'a dyn SupervisedDevice,
        retry_count: u32,
    ) -> BoxFuture<'a, Result<u64, CoreError>> {
        Box::pin(async move {
            let status = device.status();
            if status.is_running() || status.is_destroyed() {
                debug!(host = host.host_name(), device = device.name(), %status, "nothing to restart");
                return Ok(0);
            }

            match device.start().await {
                Ok(()) => {
                    info!(device = %device.full_name(), retry_count, "always-running device restarted");
                    Ok(0)
                }
                Err(e) => {
                    if let Some(delay_ms) = self.delay_for(retry_count) {
                        warn!(
                            device = %device.full_name(),
                            retry_count,
                            delay_ms,
                            error = %e,
                            "restart failed, backing off"
                        );
                        Ok(delay_ms)
                    } else {
                        error!(
                            device = %device.full_name(),
                            retry_count,
                            error = %e,
                            "restart attempts exhausted, giving up"
                        );
                        Ok(0)
                    }
                }
            }
        })
    }
}
