//! CLI error types with miette diagnostics.
//!
//! Maps `ConfigError` and `CoreError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use devhost_config::ConfigError;
use devhost_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const REJECTED: i32 = 5;
    pub const DEVICE: i32 = 6;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration file not found")]
    #[diagnostic(
        code(devhost::no_config),
        help(
            "Pass one with --config or DEVHOST_CONFIG.\n\
             Expected at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(devhost::config))]
    Config(Box<figment::Error>),

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(devhost::validation))]
    Validation { field: String, reason: String },

    #[error("Invalid configuration for device '{device}': {reason}")]
    #[diagnostic(
        code(devhost::device_config),
        help("Fix the [hosts.<host>.devices.<device>] table and run: devhost check")
    )]
    DeviceConfig { device: String, reason: String },

    #[error("Host '{host}' not found in configuration")]
    #[diagnostic(code(devhost::unknown_host), help("Configured hosts: {available}"))]
    UnknownHost { host: String, available: String },

    // ── Runtime ──────────────────────────────────────────────────────
    #[error("Configuration rejected: {reason}")]
    #[diagnostic(
        code(devhost::rejected),
        help("No device was changed. Fix the configuration and try again.")
    )]
    Rejected { reason: String },

    #[error("Device '{device}' not found")]
    #[diagnostic(code(devhost::not_found))]
    NotFound { device: String },

    #[error("Device error: {message}")]
    #[diagnostic(code(devhost::device))]
    Device { message: String },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON output failed: {0}")]
    #[diagnostic(code(devhost::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoConfig { .. } | Self::Config(_) | Self::DeviceConfig { .. } => {
                exit_code::CONFIG
            }
            Self::Validation { .. } => exit_code::USAGE,
            Self::UnknownHost { .. } | Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Rejected { .. } => exit_code::REJECTED,
            Self::Device { .. } => exit_code::DEVICE,
            Self::Io(_) | Self::Json(_) => exit_code::GENERAL,
        }
    }
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::UnknownHost { host, available } => Self::UnknownHost {
                host,
                available: available.join(", "),
            },
            ConfigError::Device {
                host,
                device,
                reason,
            } => Self::DeviceConfig {
                device: format!("{host}.{device}"),
                reason,
            },
            ConfigError::Serialization(e) => Self::Validation {
                field: "config".into(),
                reason: e.to_string(),
            },
            ConfigError::Figment(e) => Self::Config(e),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidConfiguration { device, reason } => {
                Self::DeviceConfig { device, reason }
            }
            e @ (CoreError::DuplicateDevice { .. } | CoreError::EmptyConfiguration { .. }) => {
                Self::Rejected {
                    reason: e.to_string(),
                }
            }
            CoreError::DeviceNotFound { host, device } => Self::NotFound {
                device: format!("{host}.{device}"),
            },
            other => Self::Device {
                message: other.to_string(),
            },
        }
    }
}
