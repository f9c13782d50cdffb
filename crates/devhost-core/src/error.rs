// ── Core error types ──
//
// Every failure the device core can report. Variants carry plain strings
// so the type stays `Clone`: a single error is fanned out to every waiter
// of a `Completion` and copied into apply reports.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    // ── Validation errors ────────────────────────────────────────────
    #[error("Invalid configuration for device '{device}': {reason}")]
    InvalidConfiguration { device: String, reason: String },

    #[error("Duplicate device name in configuration: {name}")]
    DuplicateDevice { name: String },

    #[error("Empty configuration rejected for host '{host}'")]
    EmptyConfiguration { host: String },

    // ── Access errors ────────────────────────────────────────────────
    #[error("Controller key mismatch for device '{device}'")]
    ControllerKeyMismatch { device: String },

    // ── Execution errors ─────────────────────────────────────────────
    #[error("Device '{device}' is not running")]
    DeviceNotRunning { device: String },

    #[error("Device '{device}' has been destroyed")]
    DeviceDestroyed { device: String },

    #[error("Device '{device}' requires a restart to apply the new configuration")]
    RestartRequired { device: String },

    #[error("Operation canceled")]
    Canceled,

    #[error("Operation failed: {message}")]
    OperationFailed { message: String },

    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Device not found: {device} (host '{host}')")]
    DeviceNotFound { host: String, device: String },

    #[error("No device type registered for configuration kind '{kind}' (tried: {tried})")]
    DeviceTypeNotFound { kind: String, tried: String },

    // ── Infrastructure errors ────────────────────────────────────────
    #[error("Retry policy failed for device '{device}': {message}")]
    RetryPolicy { device: String, message: String },

    // ── Completion misuse ────────────────────────────────────────────
    #[error("Completion already settled")]
    AlreadySettled,

    // ── Codec errors ─────────────────────────────────────────────────
    #[error("Configuration serialization failed: {message}")]
    Serialization { message: String },

    #[error("Unsupported configuration envelope version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Configuration kind mismatch: expected '{expected}', found '{found}'")]
    KindMismatch { expected: String, found: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a handler-level failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    pub fn invalid(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
