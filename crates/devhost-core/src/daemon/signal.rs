// ── Daemon wake signal ──

use std::sync::Arc;

use tokio::sync::watch;

/// Generation counter that wakes the daemon loop.
///
/// Every `notify` bumps the generation. A `watch` receiver remembers the
/// last generation it saw, so a notification sent while the daemon is busy
/// is observed on its next wait.
#[derive(Debug, Clone)]
pub struct DaemonSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for DaemonSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}
