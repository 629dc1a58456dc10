//! # Composable Requests Runtime
//!
//! Runtime for deduplicated, cancellable async requests tracked in a reducer
//! store.
//!
//! ## Core Components
//!
//! - **Store**: owns application state, runs the reducer and executes effects
//! - **`RequestMiddleware`**: the dispatch interceptor; admits, deduplicates and
//!   starts requests and publishes their lifecycle into the store
//! - **`RequestHandle`**: the live object returned for every dispatch (await,
//!   cancel, retry)
//! - **`RequestDispatcher`** / **`TrackedRequest`**: caller-side helpers that
//!   remember the most recently started handle
//! - **`StatusWatch`**: wait for a status change of one identifier
//!
//! ## Example
//!
//! ```ignore
//! use composable_requests_core::{RequestDescriptor, RequestsReducer, StatusTable};
//! use composable_requests_runtime::{RequestMiddleware, Store};
//!
//! let store = Store::new(StatusTable::default(), RequestsReducer, ());
//! let middleware = RequestMiddleware::for_store(&store).build();
//!
//! let handle = middleware.dispatch(RequestDescriptor::new("users", load_users))?;
//! assert!(middleware.status("users").is_pending);
//!
//! let users = handle.await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Request registry (identifier → in-flight handle)
pub mod registry;

/// Request handles
pub mod handle;

/// The dispatch interceptor
pub mod middleware;

/// Store runtime for coordinating reducer execution and effect handling
pub mod store;

/// Forwarding admitted handles to the next stage
pub mod downstream;

/// Waiting for status changes of one identifier
pub mod watch;

/// Caller-side helpers remembering the latest handle
pub mod dispatcher;

/// Prometheus metrics for observability
pub mod metrics;

pub use dispatcher::{RequestDispatcher, TrackedRequest, request_status};
pub use downstream::{ChannelDownstream, Downstream, Forwarded, NoDownstream};
pub use error::{DispatchError, StoreError};
pub use handle::{RequestHandle, RequestResult};
pub use middleware::{MiddlewareBuilder, RequestMiddleware};
pub use store::Store;
pub use watch::StatusWatch;

/// Error types for the request runtime
pub mod error {
    use composable_requests_core::{MalformedRequest, RequestId};
    use thiserror::Error;

    /// Errors returned synchronously by [`RequestMiddleware::dispatch`](crate::RequestMiddleware::dispatch).
    ///
    /// Operation failures are never reported here; they reach callers through
    /// the handle's result future.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum DispatchError {
        /// The descriptor failed validation
        #[error(transparent)]
        MalformedRequest(#[from] MalformedRequest),

        /// The identifier is in flight with a different output type
        #[error("request {id} is already in flight with a different output type")]
        OutputMismatch {
            /// The conflicting identifier
            id: RequestId,
        },

        /// `dispatch` was called outside a Tokio runtime
        #[error("request dispatch requires a Tokio runtime")]
        NoRuntime,

        /// The middleware the handle came from was dropped
        #[error("request middleware is gone")]
        Closed,
    }

    /// Errors that can occur during Store operations
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        ///
        /// This error is returned when `send()` is called after shutdown initiated.
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timeout waiting for an action
        #[error("Timeout waiting for action")]
        Timeout,

        /// Action broadcast channel closed
        ///
        /// Every store clone was dropped.
        #[error("Action broadcast channel closed")]
        ChannelClosed,
    }
}

/// Configuration for a [`RequestMiddleware`].
///
/// # Example
///
/// ```
/// use composable_requests_runtime::RequestConfig;
///
/// let config = RequestConfig::default().with_abort_on_cancel(true);
/// assert!(config.abort_on_cancel);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Abort the operation's task when its handle is canceled.
    ///
    /// Off by default: a canceled operation keeps running unobserved. The
    /// identifier is freed immediately either way.
    pub abort_on_cancel: bool,
}

impl RequestConfig {
    /// Set whether cancel aborts the underlying task
    #[must_use]
    pub const fn with_abort_on_cancel(mut self, abort: bool) -> Self {
        self.abort_on_cancel = abort;
        self
    }
}

/// Configuration for Store instances
///
/// # Example
///
/// ```ignore
/// let config = StoreConfig::default()
///     .with_broadcast_capacity(256)
///     .with_shutdown_timeout(Duration::from_secs(5));
///
/// let store = Store::with_config(state, reducer, env, config);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity of the action broadcast channel
    pub broadcast_capacity: usize,
    /// Default timeout for graceful shutdown
    pub default_shutdown_timeout: Duration,
}

impl StoreConfig {
    /// Create a new configuration with custom values
    #[must_use]
    pub const fn new(broadcast_capacity: usize, default_shutdown_timeout: Duration) -> Self {
        Self {
            broadcast_capacity,
            default_shutdown_timeout,
        }
    }

    /// Set the action broadcast capacity
    ///
    /// Increase when observers (status watches) frequently lag.
    #[must_use]
    pub const fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Set the default shutdown timeout
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.default_shutdown_timeout = timeout;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 16,
            default_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Guard that decrements an atomic counter on drop (for shutdown tracking)
struct AtomicCounterGuard(Arc<AtomicUsize>);

impl AtomicCounterGuard {
    fn increment(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for AtomicCounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
