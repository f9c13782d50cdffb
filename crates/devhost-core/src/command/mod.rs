// ── Command API ──
//
// Queued device commands carry a device-specific payload plus the
// routing, access and scheduling metadata the command loop enforces.
// Structural operations (start/stop/reconfigure/destroy/controller key)
// never enter the queue: they are "immediate" and run under the host
// lock, expressed as `StructuralCommand`.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::completion::Completion;
use crate::device::ReconfigureOutcome;
use crate::model::StoppedBehavior;

/// Where a command is headed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandTarget {
    /// Host name, if the producer routes through a host.
    pub host: Option<String>,
    pub device: String,
}

/// A queued command for a device.
///
/// `P` is the driver's command payload, `T` its result type. The
/// [`Completion`] is shared with the producer; grab it with
/// [`completion()`](Self::completion) before sending.
pub struct Command<P, T> {
    target: CommandTarget,
    controller_key: Option<String>,
    stopped_behavior: StoppedBehavior,
    cancel: CancellationToken,
    payload: P,
    completion: Completion<T>,
}

impl<P, T: Clone + Send + Sync + 'static> Command<P, T> {
    pub fn new(device: impl Into<String>, payload: P) -> Self {
        Self::with_completion(device, payload, Completion::new())
    }

    /// Build a command around a pre-configured completion (e.g. one with
    /// error or cancel transforms).
    pub fn with_completion(device: impl Into<String>, payload: P, completion: Completion<T>) -> Self {
        Self {
            target: CommandTarget {
                host: None,
                device: device.into(),
            },
            controller_key: None,
            stopped_behavior: StoppedBehavior::default(),
            cancel: CancellationToken::new(),
            payload,
            completion,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.target.host = Some(host.into());
        self
    }

    /// Require the device's controller key to match `key`.
    pub fn controller_key(mut self, key: impl Into<String>) -> Self {
        self.controller_key = Some(key.into());
        self
    }

    pub fn stopped_behavior(mut self, behavior: StoppedBehavior) -> Self {
        self.stopped_behavior = behavior;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn target(&self) -> &CommandTarget {
        &self.target
    }

    pub fn required_key(&self) -> Option<&str> {
        self.controller_key.as_deref()
    }

    pub fn behavior(&self) -> StoppedBehavior {
        self.stopped_behavior
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn completion(&self) -> Completion<T> {
        self.completion.clone()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn settle(&self, result: Result<T, crate::CoreError>) -> bool {
        self.completion.try_set(result)
    }

    pub(crate) fn into_parts(self) -> (P, CancellationToken, Completion<T>) {
        (self.payload, self.cancel, self.completion)
    }
}

impl<P: fmt::Debug, T> fmt::Debug for Command<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("target", &self.target)
            .field("controller_key", &self.controller_key.as_ref().map(|_| "<set>"))
            .field("stopped_behavior", &self.stopped_behavior)
            .field("canceled", &self.cancel.is_cancelled())
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

// ── Structural (immediate) commands ──────────────────────────────

/// Operations that change a device's existence or identity.
///
/// Always immediate: executed directly under the owning host's lock,
/// never through the device queue.
#[derive(Debug, Clone)]
pub enum StructuralCommand<C> {
    Start,
    Stop,
    Reconfigure(C),
    Destroy,
    SetControllerKey(Option<String>),
}

impl<C> StructuralCommand<C> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reconfigure(_) => "reconfigure",
            Self::Destroy => "destroy",
            Self::SetControllerKey(_) => "set_controller_key",
        }
    }
}

/// Result of a [`StructuralCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralResult {
    Done,
    Reconfigured(ReconfigureOutcome),
}
