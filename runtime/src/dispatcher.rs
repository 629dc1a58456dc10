//! Caller-side helpers that remember the most recently started handle.
//!
//! A [`RequestDispatcher`] wraps an action creator (arguments → descriptor)
//! and a middleware. Each `start` dispatches a fresh descriptor; `cancel`,
//! `retry`, `result` and `id` act on the latest handle. [`TrackedRequest`]
//! adds the status of that latest identifier.

use crate::error::DispatchError;
use crate::handle::{RequestHandle, RequestResult};
use crate::middleware::RequestMiddleware;
use composable_requests_core::{RequestDescriptor, RequestId, StatusSource, StatusView};

type Creator<Args, T> = Box<dyn Fn(Args) -> RequestDescriptor<T> + Send + Sync>;

/// Dispatches descriptors built by an action creator and tracks the latest handle.
///
/// # Example
///
/// ```ignore
/// let mut users = RequestDispatcher::new(middleware.clone(), |page: u32| {
///     RequestDescriptor::new(format!("users/{page}"), move || fetch_users(page))
/// });
///
/// users.start(1)?;
/// users.cancel();
/// ```
pub struct RequestDispatcher<Args, T> {
    middleware: RequestMiddleware,
    creator: Creator<Args, T>,
    latest: Option<RequestHandle<T>>,
}

impl<Args, T> RequestDispatcher<Args, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a dispatcher around an action creator.
    pub fn new<F>(middleware: RequestMiddleware, creator: F) -> Self
    where
        F: Fn(Args) -> RequestDescriptor<T> + Send + Sync + 'static,
    {
        Self {
            middleware,
            creator: Box::new(creator),
            latest: None,
        }
    }

    /// Swap the action creator. Later starts use the new one.
    pub fn replace_creator<F>(&mut self, creator: F)
    where
        F: Fn(Args) -> RequestDescriptor<T> + Send + Sync + 'static,
    {
        self.creator = Box::new(creator);
    }

    /// Build a descriptor from `args` and dispatch it.
    ///
    /// The returned handle becomes the latest one, even when it was
    /// deduplicated or discarded.
    ///
    /// # Errors
    ///
    /// Any error [`RequestMiddleware::dispatch`] returns; the latest handle is
    /// left unchanged.
    pub fn start(&mut self, args: Args) -> Result<RequestHandle<T>, DispatchError> {
        let handle = self.middleware.dispatch((self.creator)(args))?;
        self.latest = Some(handle.clone());
        Ok(handle)
    }

    /// Cancel the latest handle. No-op before the first start.
    pub fn cancel(&self) {
        if let Some(handle) = &self.latest {
            handle.cancel();
        }
    }

    /// Retry the latest handle, making the retried handle the latest.
    ///
    /// Returns `None` before the first start.
    pub fn retry(&mut self) -> Option<Result<RequestHandle<T>, DispatchError>> {
        let retried = self.latest.as_ref()?.retry();
        if let Ok(handle) = &retried {
            self.latest = Some(handle.clone());
        }
        Some(retried)
    }

    /// Result future of the latest handle.
    #[must_use]
    pub fn result(&self) -> Option<RequestResult<T>> {
        self.latest.as_ref().map(RequestHandle::result)
    }

    /// Identifier of the latest handle.
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        self.latest.as_ref().map(RequestHandle::id)
    }

    /// The latest handle.
    #[must_use]
    pub const fn latest(&self) -> Option<&RequestHandle<T>> {
        self.latest.as_ref()
    }

    /// The middleware this dispatcher submits through.
    #[must_use]
    pub const fn middleware(&self) -> &RequestMiddleware {
        &self.middleware
    }
}

impl<Args, T> std::fmt::Debug for RequestDispatcher<Args, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("latest", &self.latest)
            .finish_non_exhaustive()
    }
}

/// A [`RequestDispatcher`] that also reports the latest identifier's status.
pub struct TrackedRequest<Args, T> {
    dispatcher: RequestDispatcher<Args, T>,
}

impl<Args, T> TrackedRequest<Args, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a tracked request around an action creator.
    pub fn new<F>(middleware: RequestMiddleware, creator: F) -> Self
    where
        F: Fn(Args) -> RequestDescriptor<T> + Send + Sync + 'static,
    {
        Self {
            dispatcher: RequestDispatcher::new(middleware, creator),
        }
    }

    /// Status of the latest identifier; empty before the first start.
    #[must_use]
    pub fn status(&self) -> StatusView {
        self.dispatcher
            .id()
            .map_or_else(StatusView::default, |id| self.dispatcher.middleware().status(id.as_str()))
    }

    /// See [`RequestDispatcher::start`].
    ///
    /// # Errors
    ///
    /// Any error [`RequestMiddleware::dispatch`] returns.
    pub fn start(&mut self, args: Args) -> Result<RequestHandle<T>, DispatchError> {
        self.dispatcher.start(args)
    }

    /// See [`RequestDispatcher::replace_creator`].
    pub fn replace_creator<F>(&mut self, creator: F)
    where
        F: Fn(Args) -> RequestDescriptor<T> + Send + Sync + 'static,
    {
        self.dispatcher.replace_creator(creator);
    }

    /// See [`RequestDispatcher::cancel`].
    pub fn cancel(&self) {
        self.dispatcher.cancel();
    }

    /// See [`RequestDispatcher::retry`].
    pub fn retry(&mut self) -> Option<Result<RequestHandle<T>, DispatchError>> {
        self.dispatcher.retry()
    }

    /// See [`RequestDispatcher::result`].
    #[must_use]
    pub fn result(&self) -> Option<RequestResult<T>> {
        self.dispatcher.result()
    }

    /// See [`RequestDispatcher::id`].
    #[must_use]
    pub fn id(&self) -> Option<&RequestId> {
        self.dispatcher.id()
    }

    /// The wrapped dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &RequestDispatcher<Args, T> {
        &self.dispatcher
    }
}

impl<Args, T> std::fmt::Debug for TrackedRequest<Args, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedRequest")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Status of `id` read through any status source.
#[must_use]
pub fn request_status(source: &dyn StatusSource, id: &str) -> StatusView {
    StatusView::from(source.status(id))
}
