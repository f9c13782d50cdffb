// ── Per-device lifetime event hub ──

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::model::{LifetimeEvent, LifetimeEventKind};

const EVENT_CAPACITY: usize = 256;

/// Broadcast fan-out with a per-device sequence counter.
///
/// The counter lock is held across the send so sequence numbers reach
/// every subscriber in increasing order.
pub(crate) struct EventHub {
    tx: broadcast::Sender<Arc<LifetimeEvent>>,
    sequence: Mutex<u64>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            sequence: Mutex::new(0),
        }
    }

    pub(crate) fn emit(&self, device: &str, kind: LifetimeEventKind) -> u64 {
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        *sequence += 1;
        let event = LifetimeEvent {
            sequence: *sequence,
            device: device.to_owned(),
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.tx.send(Arc::new(event));
        *sequence
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<LifetimeEvent>> {
        self.tx.subscribe()
    }

    pub(crate) fn last_sequence(&self) -> u64 {
        *self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::DeviceStatus;

    #[tokio::test]
    async fn sequences_increase_per_hub() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        hub.emit("plant.pump", LifetimeEventKind::ConfigurationChanged);
        hub.emit(
            "plant.pump",
            LifetimeEventKind::StatusChanged {
                from: DeviceStatus::Stopped,
                to: DeviceStatus::Starting,
            },
        );

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.device, "plant.pump");
        assert_eq!(hub.last_sequence(), 2);
    }

    #[test]
    fn emit_without_subscribers_still_counts() {
        let hub = EventHub::new();
        assert_eq!(hub.emit("d", LifetimeEventKind::ConfigurationChanged), 1);
        assert_eq!(hub.emit("d", LifetimeEventKind::ConfigurationChanged), 2);
    }
}
