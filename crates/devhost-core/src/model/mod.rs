// ── Domain model ──
//
// Status enums, the configuration contract every driver implements, and
// the lifetime events devices publish to subscribers.

pub mod configuration;
pub mod device;
pub mod event;

// ── Re-exports ──────────────────────────────────────────────────────

pub use configuration::{
    DeviceConfiguration, ENVELOPE_VERSION, decode_configuration, encode_configuration,
};
pub use device::{ConfigurationStatus, DeviceStatus, StoppedBehavior};
pub use event::{LifetimeEvent, LifetimeEventKind};
