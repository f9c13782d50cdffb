// ── Completion ──
//
// One-shot, exactly-once settleable result shared by a command producer
// and the device that executes it. Backed by a `watch` channel so any
// number of waiters (early or late) observe the same terminal value.

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::error::CoreError;

/// Lifecycle of a [`Completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum CompletionState {
    Pending,
    Succeeded,
    Faulted,
    Canceled,
}

type ErrorTransform<T> = Arc<dyn Fn(&CoreError) -> T + Send + Sync>;
type CancelTransform<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Terminal record. `value` is also populated for faulted/canceled
/// completions when a transform produced a substitute result.
#[derive(Clone)]
struct Settled<T> {
    state: CompletionState,
    value: Option<T>,
    error: Option<CoreError>,
}

struct CompletionInner<T> {
    slot: watch::Sender<Option<Settled<T>>>,
    on_error: Option<ErrorTransform<T>>,
    on_cancel: Option<CancelTransform<T>>,
}

/// A one-shot result cell.
///
/// Cheaply cloneable; all clones share the same slot. Settling is
/// exactly-once: the first `set_*` / `try_set_*` call wins, later calls
/// fail (`set_*`) or return `false` (`try_set_*`).
///
/// With an error or cancel transform installed, waiting always yields
/// `Ok(..)` for the transformed outcome while [`is_error`](Self::is_error),
/// [`is_canceled`](Self::is_canceled) and [`error`](Self::error) still
/// report what really happened.
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    /// A plain completion without transforms.
    pub fn new() -> Self {
        CompletionBuilder::new().build()
    }

    pub fn builder() -> CompletionBuilder<T> {
        CompletionBuilder::new()
    }

    // ── Settling ─────────────────────────────────────────────────────

    pub fn set_result(&self, value: T) -> Result<(), CoreError> {
        self.try_set_result(value)
            .then_some(())
            .ok_or(CoreError::AlreadySettled)
    }

    pub fn try_set_result(&self, value: T) -> bool {
        self.settle(|| Settled {
            state: CompletionState::Succeeded,
            value: Some(value),
            error: None,
        })
    }

    pub fn set_error(&self, error: CoreError) -> Result<(), CoreError> {
        self.try_set_error(error)
            .then_some(())
            .ok_or(CoreError::AlreadySettled)
    }

    /// Settle as faulted. A [`CoreError::Canceled`] is recorded as a
    /// cancellation rather than a fault.
    pub fn try_set_error(&self, error: CoreError) -> bool {
        if error.is_canceled() {
            return self.try_set_canceled();
        }
        let on_error = self.inner.on_error.clone();
        self.settle(move || Settled {
            state: CompletionState::Faulted,
            value: on_error.map(|f| f(&error)),
            error: Some(error),
        })
    }

    pub fn set_canceled(&self) -> Result<(), CoreError> {
        self.try_set_canceled()
            .then_some(())
            .ok_or(CoreError::AlreadySettled)
    }

    pub fn try_set_canceled(&self) -> bool {
        let on_cancel = self.inner.on_cancel.clone();
        self.settle(move || Settled {
            state: CompletionState::Canceled,
            value: on_cancel.map(|f| f()),
            error: Some(CoreError::Canceled),
        })
    }

    /// Settle from a handler result.
    pub fn try_set(&self, result: Result<T, CoreError>) -> bool {
        match result {
            Ok(value) => self.try_set_result(value),
            Err(err) => self.try_set_error(err),
        }
    }

    fn settle(&self, make: impl FnOnce() -> Settled<T>) -> bool {
        let mut make = Some(make);
        self.inner.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = make.take().map(|f| f());
            true
        })
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn state(&self) -> CompletionState {
        self.inner
            .slot
            .borrow()
            .as_ref()
            .map_or(CompletionState::Pending, |s| s.state)
    }

    pub fn is_settled(&self) -> bool {
        self.state() != CompletionState::Pending
    }

    pub fn is_error(&self) -> bool {
        self.state() == CompletionState::Faulted
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == CompletionState::Canceled
    }

    /// The original error (or `Canceled`), even when a transform
    /// substituted a success value.
    pub fn error(&self) -> Option<CoreError> {
        self.inner
            .slot
            .borrow()
            .as_ref()
            .and_then(|s| s.error.clone())
    }

    /// Non-blocking peek at the outcome waiters will observe.
    pub fn outcome(&self) -> Option<Result<T, CoreError>> {
        self.inner.slot.borrow().as_ref().map(resolve)
    }

    // ── Waiting ──────────────────────────────────────────────────────

    /// Wait for the completion to settle.
    pub async fn wait(&self) -> Result<T, CoreError> {
        let mut rx = self.inner.slot.subscribe();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoreError::Internal("completion slot dropped".into()))?;
        settled
            .as_ref()
            .map_or_else(|| Err(CoreError::Internal("completion slot empty".into())), resolve)
    }

    /// Wait at most `timeout`. Returns `None` if still pending afterwards.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, CoreError>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

fn resolve<T: Clone>(settled: &Settled<T>) -> Result<T, CoreError> {
    if let Some(value) = &settled.value {
        return Ok(value.clone());
    }
    Err(settled.error.clone().unwrap_or(CoreError::Canceled))
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Completion<T> {
    type Output = Result<T, CoreError>;
    type IntoFuture = BoxFuture<'static, Result<T, CoreError>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self
            .inner
            .slot
            .borrow()
            .as_ref()
            .map_or(CompletionState::Pending, |s| s.state);
        f.debug_struct("Completion")
            .field("state", &state)
            .field("error_transform", &self.inner.on_error.is_some())
            .field("cancel_transform", &self.inner.on_cancel.is_some())
            .finish()
    }
}

// ── Builder ──────────────────────────────────────────────────────

/// Configures the optional error / cancel transforms of a [`Completion`].
pub struct CompletionBuilder<T> {
    on_error: Option<ErrorTransform<T>>,
    on_cancel: Option<CancelTransform<T>>,
}

impl<T: Clone + Send + Sync + 'static> CompletionBuilder<T> {
    fn new() -> Self {
        Self {
            on_error: None,
            on_cancel: None,
        }
    }

    /// Substitute a success value when the completion faults.
    pub fn on_error(mut self, f: impl Fn(&CoreError) -> T + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Substitute a success value when the completion is canceled.
    pub fn on_cancel(mut self, f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Completion<T> {
        let (slot, _) = watch::channel(None);
        Completion {
            inner: Arc::new(CompletionInner {
                slot,
                on_error: self.on_error,
                on_cancel: self.on_cancel,
            }),
        }
    }
}
