//! Dispatch interceptor - the boundary every request submission goes through.
//!
//! ```text
//! dispatch(descriptor)
//!   ├─ malformed?                        → Err(MalformedRequest)
//!   ├─ run_only_once && table = Resolved → pre-settled discarded handle
//!   ├─ registry has id                   → existing handle (factory never called)
//!   └─ otherwise                         → emit Pending, register
//!                                          (lock released) call factory,
//!                                          spawn driver
//! every admitted handle is forwarded downstream
//! ```
//!
//! The control lock (the registry mutex) is the single point of serialization:
//! admission, registration, settlement and cancellation all emit their
//! lifecycle events while holding it, so per-identifier events are applied in
//! order and a stale completion can never overwrite a successor's `Pending`.
//!
//! The operation factory is called after the lock is released. A factory may
//! dispatch through the same middleware; dispatching its own identifier joins
//! the request being started.

use crate::RequestConfig;
use crate::downstream::{Downstream, Forwarded, NoDownstream};
use crate::error::DispatchError;
use crate::handle::{HandleInner, RequestHandle};
use crate::registry::Registry;
use composable_requests_core::error::panic_message;
use composable_requests_core::{
    LifecycleEvent, LifecycleSink, RequestDescriptor, RequestError, RequestId, RequestStatus,
    StatusSource, StatusView,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// State shared by a middleware, its handles and their drivers.
pub(crate) struct Control {
    registry: Mutex<Registry>,
    sink: Arc<dyn LifecycleSink>,
    status: Arc<dyn StatusSource>,
    downstream: Arc<dyn Downstream>,
    config: RequestConfig,
}

impl Control {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) const fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Record the natural completion of an active handle.
    ///
    /// Returns `false` when the handle was canceled first; the outcome is then
    /// dropped unobserved.
    fn settle<T>(&self, inner: &HandleInner<T>, status: RequestStatus) -> bool {
        {
            let mut registry = self.lock();
            if !inner.mark_settled() {
                return false;
            }
            registry.release(inner.id().as_str(), inner.generation());
            self.sink.emit(LifecycleEvent::new(status, inner.id().clone()));
            record_in_flight(&registry);
        }

        metrics::counter!("requests.settled", "status" => status.as_str()).increment(1);
        true
    }

    /// Cancel an active handle. Returns `false` when it was already terminal.
    pub(crate) fn cancel<T>(&self, inner: &HandleInner<T>) -> bool {
        {
            let mut registry = self.lock();
            if !inner.mark_canceled() {
                tracing::trace!(id = %inner.id(), "Cancel ignored, request already terminal");
                return false;
            }
            registry.release(inner.id().as_str(), inner.generation());
            self.sink.emit(LifecycleEvent::canceled(inner.id().clone()));
            record_in_flight(&registry);
        }

        tracing::info!(id = %inner.id(), "Request canceled");
        metrics::counter!("requests.settled", "status" => RequestStatus::Canceled.as_str())
            .increment(1);
        true
    }
}

/// Dispatch interceptor owning one request registry.
///
/// Cheap to clone; clones share the registry. Independent middlewares (one
/// per store, one per test) never see each other's requests.
///
/// # Example
///
/// ```ignore
/// let store = Store::new(StatusTable::default(), RequestsReducer, ());
/// let middleware = RequestMiddleware::for_store(&store).build();
///
/// let handle = middleware.dispatch(RequestDescriptor::new("profile", fetch_profile))?;
/// let profile = handle.await?;
/// ```
#[derive(Clone)]
pub struct RequestMiddleware {
    control: Arc<Control>,
}

impl RequestMiddleware {
    /// Start building a middleware from its two store seams.
    #[must_use]
    pub fn builder(
        sink: Arc<dyn LifecycleSink>,
        status: Arc<dyn StatusSource>,
    ) -> MiddlewareBuilder {
        MiddlewareBuilder {
            sink,
            status,
            downstream: Arc::new(NoDownstream),
            config: RequestConfig::default(),
        }
    }

    /// Start building a middleware that emits into and reads from one store.
    #[must_use]
    pub fn for_store<St>(store: &St) -> MiddlewareBuilder
    where
        St: LifecycleSink + StatusSource + Clone + 'static,
    {
        Self::builder(Arc::new(store.clone()), Arc::new(store.clone()))
    }

    pub(crate) const fn from_control(control: Arc<Control>) -> Self {
        Self { control }
    }

    /// Submit a request.
    ///
    /// Returns synchronously; await the handle for the outcome. Operation
    /// failures (including a panicking factory) are delivered only through the
    /// handle's result and a `Rejected` event.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::MalformedRequest`] for a blank identifier
    /// - [`DispatchError::OutputMismatch`] when the identifier is in flight
    ///   with a different output type
    /// - [`DispatchError::NoRuntime`] outside a Tokio runtime
    #[tracing::instrument(skip(self, descriptor), fields(id = %descriptor.id()), name = "request_dispatch")]
    pub fn dispatch<T>(
        &self,
        descriptor: RequestDescriptor<T>,
    ) -> Result<RequestHandle<T>, DispatchError>
    where
        T: Clone + Send + Sync + 'static,
    {
        descriptor.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        metrics::counter!("requests.dispatched").increment(1);

        let (handle, reservation) = {
            let mut registry = self.control.lock();

            if descriptor.is_run_only_once()
                && self.control.status.status(descriptor.id().as_str())
                    == Some(RequestStatus::Resolved)
            {
                drop(registry);
                tracing::debug!("Request already resolved, discarding run-only-once dispatch");
                metrics::counter!("requests.discarded").increment(1);
                return Ok(RequestHandle::discarded(
                    descriptor,
                    Arc::downgrade(&self.control),
                ));
            }

            if let Some(existing) = registry.admit::<T>(descriptor.id().as_str())? {
                tracing::debug!(
                    generation = existing.generation(),
                    "Request already in flight, returning existing handle"
                );
                metrics::counter!("requests.deduplicated").increment(1);
                (existing, None)
            } else {
                let (handle, reservation) = self.reserve(&mut registry, descriptor);
                (handle, Some(reservation))
            }
        };

        let deduplicated = reservation.is_none();
        if let Some(reservation) = reservation {
            self.launch(&handle, reservation, &runtime);
        }

        self.control
            .downstream
            .forward(Forwarded::from_handle(&handle, deduplicated));

        Ok(handle)
    }

    /// Announce and register a new handle. Runs under the control lock.
    fn reserve<T>(
        &self,
        registry: &mut Registry,
        descriptor: RequestDescriptor<T>,
    ) -> (RequestHandle<T>, Reservation<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let generation = registry.next_generation();

        let (settle, settle_rx) = oneshot::channel::<Result<T, RequestError>>();
        let result: BoxFuture<'static, Result<T, RequestError>> = Box::pin(async move {
            match settle_rx.await {
                Ok(outcome) => outcome,
                // Sender dropped without sending: the request was canceled.
                Err(_) => futures::future::pending().await,
            }
        });

        let reservation = Reservation {
            descriptor: descriptor.clone(),
            settle,
        };
        let handle = RequestHandle::active(
            descriptor,
            generation,
            Arc::downgrade(&self.control),
            result,
        );

        self.control
            .sink
            .emit(LifecycleEvent::pending(handle.id().clone()));
        registry.register(handle.clone());
        record_in_flight(registry);

        tracing::debug!(generation, "Request registered");
        (handle, reservation)
    }

    /// Call the factory and spawn the driver. Runs without the control lock,
    /// so the factory may dispatch through this middleware.
    fn launch<T>(
        &self,
        handle: &RequestHandle<T>,
        reservation: Reservation<T>,
        runtime: &tokio::runtime::Handle,
    ) where
        T: Clone + Send + Sync + 'static,
    {
        let Reservation { descriptor, settle } = reservation;
        let operation = invoke_factory(&descriptor);

        let inner = handle.inner();
        let control = Arc::clone(&self.control);
        let task = runtime.spawn(async move {
            let outcome = operation.await;
            let status = if outcome.is_ok() {
                RequestStatus::Resolved
            } else {
                RequestStatus::Rejected
            };

            if control.settle(&inner, status) {
                match &outcome {
                    Ok(_) => tracing::debug!(id = %inner.id(), "Request resolved"),
                    Err(error) => tracing::warn!(id = %inner.id(), error = %error, "Request rejected"),
                }
                let _ = settle.send(outcome);
            } else {
                tracing::debug!(id = %inner.id(), "Canceled request finished unobserved");
            }
        });
        handle
            .inner()
            .attach_task(task.abort_handle(), self.control.config.abort_on_cancel);

        tracing::debug!(id = %handle.id(), "Request started");
        metrics::counter!("requests.started").increment(1);
    }

    /// Status of `id` as seen through this middleware's status source.
    #[must_use]
    pub fn status(&self, id: &str) -> StatusView {
        StatusView::from(self.control.status.status(id))
    }

    /// Whether `id` currently has an in-flight handle.
    #[must_use]
    pub fn is_active(&self, id: &str) -> bool {
        self.control.lock().contains(id)
    }

    /// Number of in-flight handles.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.control.lock().len()
    }

    /// The middleware configuration.
    #[must_use]
    pub fn config(&self) -> &RequestConfig {
        self.control.config()
    }
}

impl std::fmt::Debug for RequestMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMiddleware")
            .field("registry", &*self.control.lock())
            .field("config", &self.control.config)
            .finish_non_exhaustive()
    }
}

/// Everything `launch` needs once the control lock is released.
struct Reservation<T> {
    descriptor: RequestDescriptor<T>,
    settle: oneshot::Sender<Result<T, RequestError>>,
}

/// Builder for [`RequestMiddleware`].
pub struct MiddlewareBuilder {
    sink: Arc<dyn LifecycleSink>,
    status: Arc<dyn StatusSource>,
    downstream: Arc<dyn Downstream>,
    config: RequestConfig,
}

impl MiddlewareBuilder {
    /// Forward every admitted handle to `downstream`.
    #[must_use]
    pub fn downstream(mut self, downstream: Arc<dyn Downstream>) -> Self {
        self.downstream = downstream;
        self
    }

    /// Use a custom configuration.
    #[must_use]
    pub const fn config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish the middleware with an empty registry.
    #[must_use]
    pub fn build(self) -> RequestMiddleware {
        RequestMiddleware {
            control: Arc::new(Control {
                registry: Mutex::new(Registry::new()),
                sink: self.sink,
                status: self.status,
                downstream: self.downstream,
                config: self.config,
            }),
        }
    }
}

/// Call the operation factory exactly once, turning a panic into a rejection.
fn invoke_factory<T>(
    descriptor: &RequestDescriptor<T>,
) -> BoxFuture<'static, Result<T, RequestError>>
where
    T: Send + 'static,
{
    let id: RequestId = descriptor.id().clone();

    match std::panic::catch_unwind(AssertUnwindSafe(|| (descriptor.operation())())) {
        Ok(operation) => Box::pin(async move {
            match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(cause)) => Err(RequestError::operation(id, cause)),
                Err(payload) => Err(RequestError::OperationPanicked {
                    id,
                    message: panic_message(payload.as_ref()),
                }),
            }
        }),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::warn!(id = %id, message = %message, "Operation factory panicked");
            Box::pin(futures::future::ready(Err(RequestError::FactoryPanicked {
                id,
                message,
            })))
        },
    }
}

#[allow(clippy::cast_precision_loss)] // registry sizes are far below 2^52
fn record_in_flight(registry: &Registry) {
    metrics::gauge!("requests.in_flight").set(registry.len() as f64);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use composable_requests_core::StatusTable;
    use std::time::Duration;

    /// Sink + source backed by a plain table, recording every event.
    #[derive(Default)]
    struct Recorder {
        table: Mutex<StatusTable>,
        events: Mutex<Vec<LifecycleEvent>>,
    }

    impl LifecycleSink for Recorder {
        fn emit(&self, event: LifecycleEvent) {
            self.table.lock().unwrap().apply(&event);
            self.events.lock().unwrap().push(event);
        }
    }

    impl StatusSource for Recorder {
        fn status(&self, id: &str) -> Option<RequestStatus> {
            self.table.lock().unwrap().get(id)
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<RequestStatus> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    fn middleware() -> (RequestMiddleware, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let middleware = RequestMiddleware::builder(recorder.clone(), recorder.clone()).build();
        (middleware, recorder)
    }

    fn value(n: u32) -> RequestDescriptor<u32> {
        RequestDescriptor::new("value", move || async move { Ok::<_, anyhow::Error>(n) })
    }

    #[test]
    fn test_dispatch_outside_runtime() {
        let (middleware, recorder) = middleware();
        assert_eq!(middleware.dispatch(value(1)).unwrap_err(), DispatchError::NoRuntime);
        assert!(recorder.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_blank_identifier_is_rejected_synchronously() {
        let (middleware, recorder) = middleware();
        let descriptor = RequestDescriptor::new("  ", || async { Ok::<_, anyhow::Error>(1_u32) });

        assert!(matches!(
            middleware.dispatch(descriptor),
            Err(DispatchError::MalformedRequest(_))
        ));
        assert!(recorder.kinds().is_empty());
        assert_eq!(middleware.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_same_identifier_with_other_output_type() {
        let (middleware, _) = middleware();
        let slow = RequestDescriptor::new("value", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, anyhow::Error>(1_u32)
        });
        let _handle = middleware.dispatch(slow).unwrap();

        let text = RequestDescriptor::new("value", || async { Ok::<_, anyhow::Error>("one") });
        assert!(matches!(
            middleware.dispatch(text),
            Err(DispatchError::OutputMismatch { id }) if id.as_str() == "value"
        ));
    }

    #[tokio::test]
    async fn test_factory_panic_becomes_rejection() {
        let (middleware, recorder) = middleware();
        let descriptor = RequestDescriptor::<u32>::new("boom", || -> futures::future::Ready<anyhow::Result<u32>> {
            panic!("factory exploded")
        });

        let handle = middleware.dispatch(descriptor).unwrap();
        match handle.await {
            Err(RequestError::FactoryPanicked { message, .. }) => {
                assert_eq!(message, "factory exploded");
            },
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(recorder.kinds(), vec![RequestStatus::Pending, RequestStatus::Rejected]);
        assert!(!middleware.is_active("boom"));
    }

    #[tokio::test]
    async fn test_operation_panic_becomes_rejection() {
        let (middleware, recorder) = middleware();
        let descriptor = RequestDescriptor::<u32>::new("boom", || async {
            if true {
                panic!("operation exploded");
            }
            Ok::<_, anyhow::Error>(0)
        });

        let outcome = middleware.dispatch(descriptor).unwrap().await;
        assert!(matches!(outcome, Err(RequestError::OperationPanicked { .. })));
        assert_eq!(recorder.status("boom"), Some(RequestStatus::Rejected));
    }

    #[tokio::test]
    async fn test_cancel_releases_registry_slot() {
        let (middleware, recorder) = middleware();
        let slow = RequestDescriptor::new("slot", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, anyhow::Error>(1_u32)
        });
        let handle = middleware.dispatch(slow).unwrap();
        assert_eq!(middleware.in_flight(), 1);

        handle.cancel();
        assert_eq!(middleware.in_flight(), 0);
        assert_eq!(recorder.kinds(), vec![RequestStatus::Pending, RequestStatus::Canceled]);
    }

    #[tokio::test]
    async fn test_factory_may_dispatch_through_same_middleware() {
        let (middleware, recorder) = middleware();
        let nested: Arc<Mutex<Vec<RequestHandle<u32>>>> = Arc::default();

        let outer = {
            let middleware = middleware.clone();
            let nested = Arc::clone(&nested);
            RequestDescriptor::new("outer", move || {
                let child = RequestDescriptor::new("child", || async { Ok::<_, anyhow::Error>(2_u32) });
                nested.lock().unwrap().push(middleware.dispatch(child).unwrap());
                // Same identifier: joins the request being started.
                let again = RequestDescriptor::new("outer", || async { Ok::<_, anyhow::Error>(99_u32) });
                nested.lock().unwrap().push(middleware.dispatch(again).unwrap());
                async { Ok::<_, anyhow::Error>(1_u32) }
            })
        };

        let handle = middleware.dispatch(outer).unwrap();
        assert_eq!(handle.clone().await.unwrap(), 1);

        let nested: Vec<_> = nested.lock().unwrap().drain(..).collect();
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[0].clone().await.unwrap(), 2);
        assert_eq!(nested[1].generation(), handle.generation());
        assert_eq!(nested[1].clone().await.unwrap(), 1);

        assert_eq!(recorder.status("outer"), Some(RequestStatus::Resolved));
        assert_eq!(recorder.status("child"), Some(RequestStatus::Resolved));
    }

    #[tokio::test]
    async fn test_cancel_from_factory_aborts_when_configured() {
        let recorder = Arc::new(Recorder::default());
        let middleware = RequestMiddleware::builder(recorder.clone(), recorder.clone())
            .config(RequestConfig::default().with_abort_on_cancel(true))
            .build();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let descriptor = {
            let middleware = middleware.clone();
            let finished = Arc::clone(&finished);
            RequestDescriptor::new("short-lived", move || {
                // Cancels before the driver task is attached.
                let joined = middleware
                    .dispatch(RequestDescriptor::new("short-lived", || async {
                        Ok::<_, anyhow::Error>(())
                    }))
                    .unwrap();
                joined.cancel();
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    finished.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            })
        };

        let handle = middleware.dispatch(descriptor).unwrap();
        assert!(handle.is_canceled());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!finished.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(recorder.kinds(), vec![RequestStatus::Pending, RequestStatus::Canceled]);
        assert!(!middleware.is_active("short-lived"));
    }

    #[tokio::test]
    async fn test_in_flight_tracks_registry() {
        let (middleware, _) = middleware();
        let handle = middleware.dispatch(value(7)).unwrap();
        assert!(middleware.is_active("value"));
        assert_eq!(middleware.in_flight(), 1);

        assert_eq!(handle.await.unwrap(), 7);
        assert_eq!(middleware.in_flight(), 0);
    }
}
