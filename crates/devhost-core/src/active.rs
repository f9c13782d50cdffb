// ── Active event loop ──
//
// A secondary queue a device can raise typed events into without
// blocking its command loop. One task per loop; events reach the handler
// in the order they were raised.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Cloneable raising side of an [`ActiveEventLoop`].
pub struct ActiveEventSender<E> {
    tx: mpsc::UnboundedSender<E>,
    cancel: CancellationToken,
}

impl<E> Clone for ActiveEventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<E> ActiveEventSender<E> {
    /// Queue an event. Never blocks; `false` once the loop is shut down.
    pub fn raise(&self, event: E) -> bool {
        !self.cancel.is_cancelled() && self.tx.send(event).is_ok()
    }
}

impl<E> fmt::Debug for ActiveEventSender<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveEventSender")
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Background task feeding raised events to an async handler.
pub struct ActiveEventLoop<E> {
    name: Arc<str>,
    sender: ActiveEventSender<E>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> ActiveEventLoop<E> {
    /// Start the loop. Handler errors and panics are logged; the loop
    /// keeps going.
    pub fn spawn<F, Fut>(name: impl Into<String>, mut handler: F) -> Self
    where
        F: FnMut(E) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<E>();
        let cancel = CancellationToken::new();

        let loop_name = Arc::clone(&name);
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            debug!(event_loop = %loop_name, "active event loop started");
            loop {
                tokio::select! {
                    biased;
                    () = loop_cancel.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        match AssertUnwindSafe(handler(event)).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                warn!(event_loop = %loop_name, error = %e, "event handler failed");
                            }
                            Err(_) => {
                                warn!(event_loop = %loop_name, "event handler panicked");
                            }
                        }
                    }
                }
            }
            debug!(event_loop = %loop_name, dropped = rx.len(), "active event loop stopped");
        });

        Self {
            name,
            sender: ActiveEventSender { tx, cancel },
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raise(&self, event: E) -> bool {
        self.sender.raise(event)
    }

    pub fn sender(&self) -> ActiveEventSender<E> {
        self.sender.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.sender.cancel.is_cancelled()
    }

    /// Stop the task. Events not yet handled are dropped; an event
    /// already in its handler finishes first.
    pub async fn shutdown(&self) {
        self.sender.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl<E> Drop for ActiveEventLoop<E> {
    fn drop(&mut self) {
        self.sender.cancel.cancel();
    }
}

impl<E> fmt::Debug for ActiveEventLoop<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveEventLoop")
            .field("name", &self.name)
            .field("running", &!self.sender.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn delivers_in_order_and_survives_failures() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let events = ActiveEventLoop::spawn("readings", move |value: u32| {
            let seen_tx = seen_tx.clone();
            async move {
                if value == 2 {
                    return Err(CoreError::failed("sensor glitch"));
                }
                let _ = seen_tx.send(value);
                Ok(())
            }
        });

        let sender = events.sender();
        for value in 1..=4 {
            assert!(sender.raise(value));
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(seen_rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![1, 3, 4]);
        assert!(events.is_running());
    }

    #[tokio::test]
    async fn raise_fails_after_shutdown() {
        let handled = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&handled);
        let events = ActiveEventLoop::spawn("noop", move |_: ()| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        });
        let sender = events.sender();

        events.shutdown().await;

        assert!(!events.raise(()));
        assert!(!sender.raise(()));
        assert!(!events.is_running());
        assert_eq!(*handled.lock().unwrap(), 0);
    }
}
