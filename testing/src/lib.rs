//! # Composable Requests Testing
//!
//! Testing utilities and helpers for composable requests.
//!
//! This crate provides:
//! - Mock lifecycle sinks and scripted operations
//! - A ready-made store and middleware harness
//! - Property-based testing strategies
//! - Assertion helpers for reducers and status tables
//!
//! ## Example
//!
//! ```ignore
//! use composable_requests_testing::{TestHarness, mocks::ScriptedOperation};
//!
//! #[tokio::test]
//! async fn test_dedup() {
//!     let harness = TestHarness::new();
//!     let op = ScriptedOperation::resolving(42).with_delay(Duration::from_millis(20));
//!
//!     let first = harness.dispatch(op.descriptor("answer")).unwrap();
//!     let second = harness.dispatch(op.descriptor("answer")).unwrap();
//!
//!     assert_eq!(first.await.unwrap(), second.await.unwrap());
//!     assert_eq!(op.calls(), 1);
//! }
//! ```

use composable_requests_core::{
    LifecycleEvent, RequestDescriptor, RequestId, RequestStatus, RequestsReducer, StatusSource,
    StatusTable, StatusView,
};
use composable_requests_runtime::{
    ChannelDownstream, DispatchError, Forwarded, RequestConfig, RequestHandle, RequestMiddleware,
    Store,
};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc};


pub use reducer_test::{ReducerTest, assertions};

/// Mock implementations of the runtime seams
pub mod mocks {
    use composable_requests_core::{
        LifecycleEvent, LifecycleSink, RequestDescriptor, RequestStatus, StatusSource, StatusTable,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Lifecycle sink that records every event.
    ///
    /// Applies events to its own table (so it doubles as a [`StatusSource`])
    /// and optionally passes them on to another sink.
    ///
    /// # Example
    ///
    /// ```
    /// use composable_requests_core::{LifecycleEvent, LifecycleSink, RequestStatus};
    /// use composable_requests_testing::mocks::RecordingSink;
    ///
    /// let sink = RecordingSink::new();
    /// sink.emit(LifecycleEvent::pending("a"));
    /// sink.emit(LifecycleEvent::resolved("a"));
    ///
    /// assert_eq!(sink.history("a"), vec![RequestStatus::Pending, RequestStatus::Resolved]);
    /// ```
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<LifecycleEvent>>,
        table: Mutex<StatusTable>,
        next: Option<Arc<dyn LifecycleSink>>,
    }

    impl RecordingSink {
        /// Create a sink that only records.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a sink that records, then passes every event to `next`.
        #[must_use]
        pub fn forwarding_to(next: Arc<dyn LifecycleSink>) -> Self {
            Self {
                next: Some(next),
                ..Self::default()
            }
        }

        /// All recorded events, in emission order.
        #[must_use]
        pub fn events(&self) -> Vec<LifecycleEvent> {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Statuses emitted for `id`, in emission order.
        #[must_use]
        pub fn history(&self, id: &str) -> Vec<RequestStatus> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|event| event.id.as_str() == id)
                .map(|event| event.kind)
                .collect()
        }

        /// Snapshot of the recorded table.
        #[must_use]
        pub fn table(&self) -> StatusTable {
            self.table.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Forget everything recorded so far.
        pub fn clear(&self) {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
            *self.table.lock().unwrap_or_else(PoisonError::into_inner) = StatusTable::new();
        }
    }

    impl LifecycleSink for RecordingSink {
        fn emit(&self, event: LifecycleEvent) {
            self.table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(&event);
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());

            if let Some(next) = &self.next {
                next.emit(event);
            }
        }
    }

    impl StatusSource for RecordingSink {
        fn status(&self, id: &str) -> Option<RequestStatus> {
            self.table.lock().unwrap_or_else(PoisonError::into_inner).get(id)
        }
    }

    impl std::fmt::Debug for RecordingSink {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RecordingSink")
                .field("events", &self.events())
                .finish_non_exhaustive()
        }
    }

    /// One scripted invocation: wait, then resolve or reject.
    #[derive(Debug, Clone)]
    struct Step<T> {
        delay: Duration,
        outcome: Result<T, String>,
    }

    struct Script<T> {
        steps: Mutex<VecDeque<Step<T>>>,
        last: Mutex<Option<Step<T>>>,
        calls: AtomicUsize,
        completed: AtomicUsize,
    }

    /// Operation factory driven by a script of outcomes.
    ///
    /// Each factory invocation consumes the next step; once the script is
    /// exhausted the last step repeats. Counts invocations (`calls`) and
    /// operations that ran to the end (`completed`), which is how tests tell
    /// "never started" from "finished unobserved".
    ///
    /// # Example
    ///
    /// ```
    /// use composable_requests_testing::mocks::ScriptedOperation;
    /// use std::time::Duration;
    ///
    /// let op = ScriptedOperation::rejecting("first try fails")
    ///     .then_resolve(7_u32)
    ///     .with_delay(Duration::from_millis(5));
    ///
    /// let descriptor = op.descriptor("flaky");
    /// assert_eq!(op.calls(), 0);
    /// # let _ = descriptor;
    /// ```
    pub struct ScriptedOperation<T> {
        script: Arc<Script<T>>,
        delay: Duration,
    }

    impl<T> ScriptedOperation<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        fn starting_with(outcome: Result<T, String>) -> Self {
            let step = Step {
                delay: Duration::ZERO,
                outcome,
            };
            Self {
                script: Arc::new(Script {
                    steps: Mutex::new(VecDeque::from([step])),
                    last: Mutex::new(None),
                    calls: AtomicUsize::new(0),
                    completed: AtomicUsize::new(0),
                }),
                delay: Duration::ZERO,
            }
        }

        /// Script whose first invocation resolves with `value`.
        #[must_use]
        pub fn resolving(value: T) -> Self {
            Self::starting_with(Ok(value))
        }

        /// Script whose first invocation rejects with `message`.
        #[must_use]
        pub fn rejecting(message: impl Into<String>) -> Self {
            Self::starting_with(Err(message.into()))
        }

        /// Append a resolving step.
        #[must_use]
        pub fn then_resolve(self, value: T) -> Self {
            self.push(Ok(value))
        }

        /// Append a rejecting step.
        #[must_use]
        pub fn then_reject(self, message: impl Into<String>) -> Self {
            self.push(Err(message.into()))
        }

        fn push(self, outcome: Result<T, String>) -> Self {
            self.script
                .steps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(Step {
                    delay: self.delay,
                    outcome,
                });
            self
        }

        /// Delay every step, including already scripted ones.
        #[must_use]
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            for step in self
                .script
                .steps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter_mut()
            {
                step.delay = delay;
            }
            self
        }

        /// Build a descriptor running this script.
        #[must_use]
        pub fn descriptor(&self, id: &str) -> RequestDescriptor<T> {
            let script = Arc::clone(&self.script);
            RequestDescriptor::new(id, move || {
                script.calls.fetch_add(1, Ordering::SeqCst);
                let step = script.next_step();
                let script = Arc::clone(&script);
                async move {
                    if let Some(step) = step {
                        tokio::time::sleep(step.delay).await;
                        script.completed.fetch_add(1, Ordering::SeqCst);
                        step.outcome.map_err(anyhow::Error::msg)
                    } else {
                        Err(anyhow::anyhow!("empty script"))
                    }
                }
            })
        }

        /// Number of factory invocations.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.script.calls.load(Ordering::SeqCst)
        }

        /// Number of operations that ran to the end.
        #[must_use]
        pub fn completed(&self) -> usize {
            self.script.completed.load(Ordering::SeqCst)
        }
    }

    impl<T: Clone> Script<T> {
        fn next_step(&self) -> Option<Step<T>> {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(step) = self
                .steps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                *last = Some(step);
            }
            last.clone()
        }
    }

    impl<T> Clone for ScriptedOperation<T> {
        fn clone(&self) -> Self {
            Self {
                script: Arc::clone(&self.script),
                delay: self.delay,
            }
        }
    }

    impl<T> std::fmt::Debug for ScriptedOperation<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScriptedOperation")
                .field("calls", &self.script.calls.load(Ordering::SeqCst))
                .field("completed", &self.script.completed.load(Ordering::SeqCst))
                .finish_non_exhaustive()
        }
    }
}

/// Property-based testing utilities
pub mod properties {
    use composable_requests_core::{LifecycleEvent, RequestStatus};
    use proptest::prelude::*;

    /// Any lifecycle status.
    pub fn status() -> impl Strategy<Value = RequestStatus> {
        prop_oneof![
            Just(RequestStatus::Pending),
            Just(RequestStatus::Resolved),
            Just(RequestStatus::Rejected),
            Just(RequestStatus::Canceled),
        ]
    }

    /// Lifecycle events over a small identifier alphabet, so ids collide.
    pub fn events(max: usize) -> impl Strategy<Value = Vec<LifecycleEvent>> {
        prop::collection::vec(
            ("[a-d]", status()).prop_map(|(id, kind)| LifecycleEvent::new(kind, id)),
            0..max,
        )
    }
}

/// Store whose whole state is a status table.
pub type RequestStore = Store<StatusTable, LifecycleEvent, (), RequestsReducer>;

/// Create an empty [`RequestStore`].
#[must_use]
pub fn test_store() -> RequestStore {
    Store::new(StatusTable::default(), RequestsReducer, ())
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A store, a middleware wired to it, an event recorder and the forwarded stream.
///
/// # Example
///
/// ```ignore
/// let harness = TestHarness::new();
/// let handle = harness.dispatch(descriptor)?;
/// assert!(harness.status("id").is_pending);
/// ```
pub struct TestHarness {
    store: RequestStore,
    recorder: Arc<mocks::RecordingSink>,
    middleware: RequestMiddleware,
    forwarded: AsyncMutex<mpsc::UnboundedReceiver<Forwarded>>,
}

impl TestHarness {
    /// Harness with the default [`RequestConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RequestConfig::default())
    }

    /// Harness with a custom middleware configuration.
    #[must_use]
    pub fn with_config(config: RequestConfig) -> Self {
        init_tracing();

        let store = test_store();
        let recorder = Arc::new(mocks::RecordingSink::forwarding_to(Arc::new(store.clone())));
        let (downstream, forwarded) = ChannelDownstream::channel();
        let middleware = RequestMiddleware::builder(recorder.clone(), Arc::new(store.clone()))
            .downstream(Arc::new(downstream))
            .config(config)
            .build();

        Self {
            store,
            recorder,
            middleware,
            forwarded: AsyncMutex::new(forwarded),
        }
    }

    /// Dispatch through the harness middleware.
    ///
    /// # Errors
    ///
    /// Any error [`RequestMiddleware::dispatch`] returns.
    pub fn dispatch<T>(&self, descriptor: RequestDescriptor<T>) -> Result<RequestHandle<T>, DispatchError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.middleware.dispatch(descriptor)
    }

    /// Status of `id` in the store.
    #[must_use]
    pub fn status(&self, id: &str) -> StatusView {
        StatusView::from(self.store.status(id))
    }

    /// Every status emitted for `id`, in order.
    #[must_use]
    pub fn history(&self, id: &str) -> Vec<RequestStatus> {
        self.recorder.history(id)
    }

    /// Next forwarded dispatch, waiting if none is queued.
    pub async fn next_forwarded(&self) -> Option<Forwarded> {
        self.forwarded.lock().await.recv().await
    }

    /// Forwarded dispatches queued so far, without waiting.
    pub async fn drain_forwarded(&self) -> Vec<(RequestId, bool)> {
        let mut forwarded = self.forwarded.lock().await;
        let mut drained = Vec::new();
        while let Ok(next) = forwarded.try_recv() {
            drained.push((next.id, next.deduplicated));
        }
        drained
    }

    /// The store.
    #[must_use]
    pub const fn store(&self) -> &RequestStore {
        &self.store
    }

    /// The middleware.
    #[must_use]
    pub const fn middleware(&self) -> &RequestMiddleware {
        &self.middleware
    }

    /// The event recorder.
    #[must_use]
    pub fn recorder(&self) -> &mocks::RecordingSink {
        &self.recorder
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("middleware", &self.middleware)
            .field("recorder", &self.recorder)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::mocks::{RecordingSink, ScriptedOperation};
    use super::*;
    use composable_requests_core::LifecycleSink;
    use std::time::Duration;

    #[test]
    fn test_recording_sink_passes_events_on() {
        let inner = Arc::new(RecordingSink::new());
        let outer = RecordingSink::forwarding_to(inner.clone());

        outer.emit(LifecycleEvent::pending("a"));
        assert_eq!(inner.history("a"), vec![RequestStatus::Pending]);
        assert_eq!(outer.status("a"), Some(RequestStatus::Pending));

        outer.clear();
        assert!(outer.events().is_empty());
        assert_eq!(inner.events().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_operation_repeats_last_step() {
        let op = ScriptedOperation::rejecting("no").then_resolve(3_u32);
        let descriptor = op.descriptor("script");

        assert!((descriptor.operation())().await.is_err());
        assert_eq!((descriptor.operation())().await.unwrap(), 3);
        assert_eq!((descriptor.operation())().await.unwrap(), 3);
        assert_eq!(op.calls(), 3);
        assert_eq!(op.completed(), 3);
    }

    #[tokio::test]
    async fn test_scripted_delay_applies_to_every_step() {
        let op = ScriptedOperation::resolving(1_u8)
            .then_resolve(2)
            .with_delay(Duration::from_millis(30));
        let descriptor = op.descriptor("slow");

        let started = tokio::time::Instant::now();
        let _ = (descriptor.operation())().await;
        let _ = (descriptor.operation())().await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_store_starts_empty() {
        assert!(test_store().state(StatusTable::is_empty));
    }
}
