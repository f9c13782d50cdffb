//! Device lifecycle runtime: supervised, command-driven devices grouped
//! into named hosts.
//!
//! This crate owns the execution model, the configuration contract, and the
//! supervision machinery shared by the `devhost` binary and any embedder:
//!
//! - **[`Device`]**: One driver instance with a private configuration
//!   copy, a status watch, and a single-consumer command queue. Queued
//!   [`Command`]s run strictly one at a time in arrival order; structural
//!   operations (start/stop/reconfigure/destroy) share the same execution
//!   gate and never overlap a handler.
//!
//! - **[`DeviceHost`]**: Named registry of devices of one driver type.
//!   [`apply_configuration()`](DeviceHost::apply_configuration) validates a
//!   whole [`ConfigurationSnapshot`] before touching anything, then creates,
//!   reconfigures, starts, stops, or destroys devices and reports a per-item
//!   [`ApplyOutcome`].
//!
//! - **[`DeviceHostDaemon`]**: Background task that restarts
//!   `AlwaysRunning` devices through a pluggable [`RetryPolicy`]
//!   (default: [`BackoffRetryPolicy`]).
//!
//! - **[`Completion`]**: Settle-once result cell shared by producers and
//!   the command loop, with cancellation and error transforms.
//!
//! - **[`LifetimeEventStream`]**: Ordered per-device lifetime events
//!   (status, configuration, controller key) with [`EventFilter`]s.
//!
//! - **[`ActiveEventLoop`]**: Secondary event queue a driver can raise
//!   into without blocking its command loop.

pub mod active;
pub mod command;
pub mod completion;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod host;
pub mod model;
pub mod stream;

#[cfg(test)]
mod test_support;

// ── Primary re-exports ──────────────────────────────────────────────
pub use active::{ActiveEventLoop, ActiveEventSender};
pub use command::{Command, CommandTarget, StructuralCommand, StructuralResult};
pub use completion::{Completion, CompletionBuilder, CompletionState};
pub use config::{
    BackoffConfig, DEFAULT_BACKOFF_MS, DaemonConfig, ExhaustedBehavior, StopBehavior,
};
pub use daemon::{
    BackoffRetryPolicy, DaemonSignal, DeviceHostDaemon, RetryContext, RetryPolicy,
    SupervisedDevice, SupervisedHost, TrackedDevice,
};
pub use device::{Device, DeviceContext, DeviceDriver, ReconfigureOutcome};
pub use error::CoreError;
pub use host::{
    ApplyOutcome, ApplyReport, ConfigurationSnapshot, DeviceFactories, DeviceHost, ItemReport,
};
pub use stream::{EventFilter, LifetimeEventStream, LifetimeStream};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    ConfigurationStatus, DeviceConfiguration, DeviceStatus, LifetimeEvent, LifetimeEventKind,
    StoppedBehavior, decode_configuration, encode_configuration,
};
