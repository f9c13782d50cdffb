// ── Filter predicates for lifetime event streams ──

use crate::model::{DeviceStatus, LifetimeEvent, LifetimeEventKind};

/// Filter predicate for lifetime events.
pub enum EventFilter {
    All,
    StatusChanges,
    /// Status changes that end in the given status.
    EnteredStatus(DeviceStatus),
    ConfigurationChanges,
    ControllerKeyChanges,
    Custom(Box<dyn Fn(&LifetimeEvent) -> bool + Send + Sync>),
}

impl EventFilter {
    pub fn matches(&self, event: &LifetimeEvent) -> bool {
        match self {
            Self::All => true,
            Self::StatusChanges => matches!(event.kind, LifetimeEventKind::StatusChanged { .. }),
            Self::EnteredStatus(status) => {
                matches!(event.kind, LifetimeEventKind::StatusChanged { to, .. } if to == *status)
            }
            Self::ConfigurationChanges => {
                matches!(event.kind, LifetimeEventKind::ConfigurationChanged)
            }
            Self::ControllerKeyChanges => {
                matches!(event.kind, LifetimeEventKind::ControllerKeyChanged { .. })
            }
            Self::Custom(f) => f(event),
        }
    }
}
