//! Request handle - one admitted request.
//!
//! A handle pairs a shared result future with the `cancel` and `retry`
//! capabilities. Clones share everything, which is how deduplicated callers
//! all observe the same outcome.
//!
//! ## Phases
//! ```text
//! Active ──settle──► Settled    (Resolved / Rejected emitted, result settles)
//!    └────cancel───► Canceled   (Canceled emitted, result never settles)
//! Discarded                     (run-only-once gate, result pre-settled)
//! ```
//! Phase changes happen only under the middleware's control lock, so exactly
//! one of settle/cancel wins and emits.

use crate::error::DispatchError;
use crate::middleware::{Control, RequestMiddleware};
use crate::registry::Generation;
use composable_requests_core::{RequestDescriptor, RequestError, RequestId};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::AbortHandle;

/// Shared future settling with a request's outcome.
///
/// Never settles when the request was canceled.
pub type RequestResult<T> = Shared<BoxFuture<'static, Result<T, RequestError>>>;

const ACTIVE: u8 = 0;
const SETTLED: u8 = 1;
const CANCELED: u8 = 2;
const DISCARDED: u8 = 3;

pub(crate) struct HandleInner<T> {
    id: RequestId,
    generation: Generation,
    phase: AtomicU8,
    control: Weak<Control>,
    descriptor: Option<RequestDescriptor<T>>,
    task: Mutex<Option<AbortHandle>>,
}

impl<T> HandleInner<T> {
    pub(crate) const fn id(&self) -> &RequestId {
        &self.id
    }

    pub(crate) const fn generation(&self) -> Generation {
        self.generation
    }

    /// Leave the active phase. Caller must hold the control lock.
    fn finish(&self, to: u8) -> bool {
        self.phase
            .compare_exchange(ACTIVE, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_settled(&self) -> bool {
        self.finish(SETTLED)
    }

    pub(crate) fn mark_canceled(&self) -> bool {
        self.finish(CANCELED)
    }

    /// Keep the driver's abort handle. A cancel that raced ahead of the
    /// attachment still aborts when `abort_on_cancel` is set.
    pub(crate) fn attach_task(&self, task: AbortHandle, abort_on_cancel: bool) {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        if abort_on_cancel && self.phase.load(Ordering::Acquire) == CANCELED {
            self.abort_task();
        }
    }

    fn abort_task(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

/// Live object for one admitted (or just terminated) request.
///
/// Await it directly, or through [`result`](Self::result), to get the outcome:
///
/// ```ignore
/// let handle = middleware.dispatch(descriptor)?;
/// let profile = handle.clone().await?;
/// ```
pub struct RequestHandle<T> {
    inner: Arc<HandleInner<T>>,
    result: RequestResult<T>,
}

impl<T> RequestHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn active(
        descriptor: RequestDescriptor<T>,
        generation: Generation,
        control: Weak<Control>,
        result: BoxFuture<'static, Result<T, RequestError>>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: descriptor.id().clone(),
                generation,
                phase: AtomicU8::new(ACTIVE),
                control,
                descriptor: Some(descriptor),
                task: Mutex::new(None),
            }),
            result: result.shared(),
        }
    }

    /// Pre-settled handle for a dispatch dropped by the run-only-once gate.
    pub(crate) fn discarded(descriptor: RequestDescriptor<T>, control: Weak<Control>) -> Self {
        let id = descriptor.id().clone();
        let outcome = Err(RequestError::Discarded { id: id.clone() });
        Self {
            inner: Arc::new(HandleInner {
                id,
                generation: 0,
                phase: AtomicU8::new(DISCARDED),
                control,
                descriptor: Some(descriptor),
                task: Mutex::new(None),
            }),
            result: futures::future::ready(outcome).boxed().shared(),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: &str, generation: Generation) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: RequestId::from(id),
                generation,
                phase: AtomicU8::new(ACTIVE),
                control: Weak::new(),
                descriptor: None,
                task: Mutex::new(None),
            }),
            result: futures::future::pending().boxed().shared(),
        }
    }

}

impl<T> RequestHandle<T> {
    pub(crate) fn inner(&self) -> Arc<HandleInner<T>> {
        Arc::clone(&self.inner)
    }

    /// The request identifier.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.inner.id
    }

    /// Registry generation this handle was admitted under.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.generation
    }

    /// The shared result future.
    ///
    /// Resolves or rejects exactly once with the operation's outcome, or stays
    /// pending forever once the request is canceled.
    #[must_use]
    pub fn result(&self) -> RequestResult<T> {
        self.result.clone()
    }

    /// Whether the operation finished (resolved or rejected) and was observed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.phase.load(Ordering::Acquire) == SETTLED
    }

    /// Whether [`cancel`](Self::cancel) won against natural completion.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.phase.load(Ordering::Acquire) == CANCELED
    }

    /// Whether the run-only-once gate dropped this dispatch.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.inner.phase.load(Ordering::Acquire) == DISCARDED
    }

    /// Cancel the request.
    ///
    /// Emits `Canceled` immediately and frees the identifier for a new
    /// request. The result future never settles afterwards and a later
    /// natural completion emits nothing. The underlying operation keeps
    /// running unobserved unless the middleware was configured to abort it.
    ///
    /// Idempotent: a no-op once the request is terminal.
    pub fn cancel(&self) {
        let Some(control) = self.inner.control.upgrade() else {
            // The driver keeps the control alive while the request is active,
            // so a dead control means the request already terminated.
            return;
        };

        if control.cancel(&self.inner) && control.config().abort_on_cancel {
            self.inner.abort_task();
        }
    }

}

impl<T> RequestHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Resubmit the original descriptor through the middleware.
    ///
    /// While the identifier is still active the retry is absorbed into the
    /// active handle; once terminal it starts a fresh request.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Closed`] when the middleware was dropped, or any
    /// error [`RequestMiddleware::dispatch`] returns.
    pub fn retry(&self) -> Result<Self, DispatchError> {
        let control = self.inner.control.upgrade().ok_or(DispatchError::Closed)?;
        let descriptor = self.inner.descriptor.clone().ok_or(DispatchError::Closed)?;

        tracing::info!(id = %self.inner.id, "Retrying request");
        metrics::counter!("requests.retried").increment(1);

        RequestMiddleware::from_control(control).dispatch(descriptor)
    }
}

impl<T> Clone for RequestHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            result: self.result.clone(),
        }
    }
}

impl<T> std::fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.inner.phase.load(Ordering::Acquire) {
            ACTIVE => "active",
            SETTLED => "settled",
            CANCELED => "canceled",
            _ => "discarded",
        };
        f.debug_struct("RequestHandle")
            .field("id", &self.inner.id)
            .field("generation", &self.inner.generation)
            .field("phase", &phase)
            .finish_non_exhaustive()
    }
}

impl<T> IntoFuture for RequestHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, RequestError>;
    type IntoFuture = RequestResult<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.result
    }
}
