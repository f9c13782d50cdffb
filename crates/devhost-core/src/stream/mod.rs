// ── Lifetime event streams ──
//
// Subscription types for consuming a device's lifetime events.

mod filter;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

pub use filter::EventFilter;

use crate::model::LifetimeEvent;

/// A subscription to one device's lifetime events.
///
/// Events arrive in emission order. The sender never waits for slow
/// subscribers: a subscriber that falls more than the channel capacity
/// behind skips the oldest events (logged at `warn`) and continues.
pub struct LifetimeEventStream {
    device: Arc<str>,
    receiver: broadcast::Receiver<Arc<LifetimeEvent>>,
}

impl LifetimeEventStream {
    pub(crate) fn new(device: Arc<str>, receiver: broadcast::Receiver<Arc<LifetimeEvent>>) -> Self {
        Self { device, receiver }
    }

    /// Wait for the next event. Returns `None` once the device is gone.
    pub async fn next_event(&mut self) -> Option<Arc<LifetimeEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(device = %self.device, skipped, "lifetime event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the next event accepted by `filter`.
    pub async fn next_matching(&mut self, filter: &EventFilter) -> Option<Arc<LifetimeEvent>> {
        loop {
            let event = self.next_event().await?;
            if filter.matches(&event) {
                return Some(event);
            }
        }
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> LifetimeStream {
        LifetimeStream {
            device: self.device,
            inner: BroadcastStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `broadcast::Receiver`.
pub struct LifetimeStream {
    device: Arc<str>,
    inner: BroadcastStream<Arc<LifetimeEvent>>,
}

impl Stream for LifetimeStream {
    type Item = Arc<LifetimeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(device = %self.device, skipped, "lifetime event stream lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
