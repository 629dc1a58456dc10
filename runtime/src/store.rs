//! The Store - runtime coordinator for a reducer.
//!
//! The request middleware holds no application state of its own. It emits
//! lifecycle events into a store (through [`LifecycleSink`]) and reads the
//! status table back (through [`StatusSource`]), both synchronously, so the
//! store applies actions under a blocking lock rather than an async one.

use crate::error::StoreError;
use crate::watch::StatusWatch;
use crate::{AtomicCounterGuard, StoreConfig};
use composable_requests_core::effect::Effect;
use composable_requests_core::reducer::Reducer;
use composable_requests_core::{
    LifecycleEvent, LifecycleSink, RequestId, RequestStatus, SmallVec, StatusSource, StatusTable,
};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// The Store - runtime coordinator for a reducer
///
/// The Store manages:
/// 1. State (behind `RwLock` for concurrent access)
/// 2. Reducer (business logic)
/// 3. Environment (injected dependencies)
/// 4. Effect execution (with feedback loop)
///
/// Cheap to clone; clones share state and the action broadcast.
///
/// # Example
///
/// ```ignore
/// let store = Store::new(StatusTable::default(), RequestsReducer, ());
///
/// store.send(LifecycleEvent::pending("users"))?;
/// assert_eq!(store.state(|table| table.get("users")), Some(RequestStatus::Pending));
/// ```
pub struct Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    state: Arc<RwLock<S>>,
    reducer: Arc<R>,
    environment: Arc<E>,
    config: StoreConfig,
    shutdown: Arc<AtomicBool>,
    pending_effects: Arc<AtomicUsize>,
    /// Every applied action is broadcast here, in application order.
    action_broadcast: broadcast::Sender<A>,
}

impl<S, A, E, R> Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
    A: Clone + Send + 'static,
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a new store with initial state, reducer, and environment
    ///
    /// Uses [`StoreConfig::default`] (broadcast capacity 16).
    #[must_use]
    pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
        Self::with_config(initial_state, reducer, environment, StoreConfig::default())
    }

    /// Create a new Store with custom configuration
    #[must_use]
    pub fn with_config(initial_state: S, reducer: R, environment: E, config: StoreConfig) -> Self {
        let (action_broadcast, _) = broadcast::channel(config.broadcast_capacity.max(1));

        Self {
            state: Arc::new(RwLock::new(initial_state)),
            reducer: Arc::new(reducer),
            environment: Arc::new(environment),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            pending_effects: Arc::new(AtomicUsize::new(0)),
            action_broadcast,
        }
    }

    /// Send an action to the store
    ///
    /// 1. Acquires the write lock on state
    /// 2. Calls the reducer with (state, action, environment)
    /// 3. Broadcasts the action to subscribers
    /// 4. Spawns the returned effects; actions they produce are fed back
    ///
    /// The new state is visible to readers as soon as this returns. Effects
    /// need a Tokio runtime and are dropped with a warning outside one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
    #[tracing::instrument(skip(self, action), name = "store_send")]
    pub fn send(&self, action: A) -> Result<(), StoreError> {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!("Rejected action: store is shutting down");
            metrics::counter!("store.shutdown.rejected_actions").increment(1);
            return Err(StoreError::ShutdownInProgress);
        }

        self.apply(action);
        Ok(())
    }

    /// Reduce one action and start its effects, ignoring the shutdown gate.
    fn apply(&self, action: A) {
        metrics::counter!("store.actions.total").increment(1);

        let effects = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            tracing::trace!("Acquired write lock on state");

            let effects = self
                .reducer
                .reduce(&mut state, action.clone(), &self.environment);

            // Broadcast under the lock so subscribers see actions in
            // application order. No receivers is not an error.
            let _ = self.action_broadcast.send(action);

            effects
        };

        tracing::trace!("Reducer completed, returned {} effects", effects.len());
        self.execute_effects(effects);
    }

    fn execute_effects(&self, effects: SmallVec<[Effect<A>; 4]>) {
        for effect in effects {
            if matches!(effect, Effect::None) {
                metrics::counter!("store.effects.executed", "type" => "none").increment(1);
                continue;
            }

            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                tracing::warn!("Dropping effect: no Tokio runtime to execute it");
                continue;
            };

            let guard = AtomicCounterGuard::increment(&self.pending_effects);
            let effect = self.run_effect(effect);
            runtime.spawn(async move {
                let _guard = guard;
                effect.await;
            });
        }
    }

    /// Turn an effect description into a future that performs it.
    fn run_effect(&self, effect: Effect<A>) -> BoxFuture<'static, ()> {
        let store = self.clone();

        match effect {
            Effect::None => {
                metrics::counter!("store.effects.executed", "type" => "none").increment(1);
                Box::pin(async {})
            },
            Effect::Future(fut) => {
                metrics::counter!("store.effects.executed", "type" => "future").increment(1);
                Box::pin(async move {
                    if let Some(action) = fut.await {
                        tracing::trace!("Effect::Future produced an action, sending to store");
                        store.feed_back(action);
                    }
                })
            },
            Effect::Delay { duration, action } => {
                metrics::counter!("store.effects.executed", "type" => "delay").increment(1);
                Box::pin(async move {
                    tokio::time::sleep(duration).await;
                    store.feed_back(*action);
                })
            },
            Effect::Parallel(effects) => {
                metrics::counter!("store.effects.executed", "type" => "parallel").increment(1);
                let running: Vec<_> = effects.into_iter().map(|e| store.run_effect(e)).collect();
                Box::pin(async move {
                    futures::future::join_all(running).await;
                })
            },
            Effect::Sequential(effects) => {
                metrics::counter!("store.effects.executed", "type" => "sequential").increment(1);
                Box::pin(async move {
                    for effect in effects {
                        store.run_effect(effect).await;
                    }
                })
            },
        }
    }

    fn feed_back(&self, action: A) {
        if let Err(error) = self.send(action) {
            tracing::trace!(%error, "Effect action dropped");
        }
    }

    /// Read current state via a closure
    ///
    /// ```ignore
    /// let tracked = store.state(|table| table.len());
    /// ```
    pub fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&S) -> T,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Subscribe to every action applied by this store
    ///
    /// If the receiver lags it skips old actions and gets
    /// [`RecvError::Lagged`](broadcast::error::RecvError::Lagged).
    #[must_use]
    pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
        self.action_broadcast.subscribe()
    }

    /// Send an action and wait for the first applied action matching `predicate`
    ///
    /// The sent action itself is broadcast too and may match.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ShutdownInProgress`]: Store is shutting down
    /// - [`StoreError::Timeout`]: no matching action within `timeout`
    /// - [`StoreError::ChannelClosed`]: the broadcast channel closed
    pub async fn send_and_wait_for<F>(
        &self,
        action: A,
        predicate: F,
        timeout: Duration,
    ) -> Result<A, StoreError>
    where
        F: Fn(&A) -> bool,
    {
        // Subscribe BEFORE sending to avoid missing the result
        let mut rx = self.action_broadcast.subscribe();
        self.send(action)?;

        tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(action) if predicate(&action) => return Ok(action),
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Action observer lagged, {} actions skipped", skipped);
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(StoreError::ChannelClosed);
                    },
                }
            }
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    /// Number of effects still running.
    #[must_use]
    pub fn pending_effects(&self) -> usize {
        self.pending_effects.load(Ordering::Acquire)
    }

    /// Initiate graceful shutdown of the store
    ///
    /// This method:
    /// 1. Sets the shutdown flag (rejecting new actions)
    /// 2. Waits for pending effects to complete (with timeout)
    ///
    /// Lifecycle events emitted by the request middleware are still applied
    /// after shutdown, so in-flight requests keep the table consistent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] if the timeout expires before all
    /// pending effects complete.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        tracing::info!("Initiating graceful shutdown");
        self.shutdown.store(true, Ordering::Release);

        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(10);

        loop {
            let pending = self.pending_effects.load(Ordering::Acquire);

            if pending == 0 {
                tracing::info!("All effects completed, shutdown successful");
                return Ok(());
            }

            if start.elapsed() >= timeout {
                tracing::error!(
                    pending_effects = pending,
                    "Shutdown timeout: {} effects still running", pending
                );
                return Err(StoreError::ShutdownTimeout(pending));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// [`shutdown`](Self::shutdown) with the configured default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] if effects are still running
    /// after [`StoreConfig::default_shutdown_timeout`].
    pub async fn shutdown_with_default_timeout(&self) -> Result<(), StoreError> {
        self.shutdown(self.config.default_shutdown_timeout).await
    }

    /// The store configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl<S, A, E, R> Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
    A: Clone + Send + 'static,
    S: AsRef<StatusTable> + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Status of `id` in the store's status table.
    #[must_use]
    pub fn request_status(&self, id: &str) -> Option<RequestStatus> {
        self.state(|state| state.as_ref().get(id))
    }

    /// Watch the status of one identifier.
    #[must_use]
    pub fn watch_status(&self, id: impl Into<RequestId>) -> StatusWatch<A> {
        // Subscribe before the first read so no change slips between them.
        let actions = self.subscribe_actions();
        let reader = StateReader {
            state: Arc::clone(&self.state),
        };
        StatusWatch::new(id.into(), Arc::new(reader), actions)
    }
}

/// Status reads over the shared state alone. Unlike a store clone it does
/// not own the action sender, so watches see the channel close.
struct StateReader<S> {
    state: Arc<RwLock<S>>,
}

impl<S> StatusSource for StateReader<S>
where
    S: AsRef<StatusTable> + Send + Sync,
{
    fn status(&self, id: &str) -> Option<RequestStatus> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .get(id)
    }
}

impl<S, A, E, R> Clone for Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            reducer: Arc::clone(&self.reducer),
            environment: Arc::clone(&self.environment),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            pending_effects: Arc::clone(&self.pending_effects),
            action_broadcast: self.action_broadcast.clone(),
        }
    }
}

impl<S, A, E, R> LifecycleSink for Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
    A: From<LifecycleEvent> + Clone + Send + 'static,
    S: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn emit(&self, event: LifecycleEvent) {
        tracing::trace!(id = %event.id, kind = %event.kind, "Applying lifecycle event");
        self.apply(A::from(event));
    }
}

impl<S, A, E, R> StatusSource for Store<S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
    A: Clone + Send + 'static,
    S: AsRef<StatusTable> + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn status(&self, id: &str) -> Option<RequestStatus> {
        self.request_status(id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use composable_requests_core::{RequestsReducer, smallvec};

    #[derive(Debug, Clone, PartialEq)]
    enum CountAction {
        Add(i64),
        AddLater(i64),
        AddTwice(i64),
        AddInOrder(i64, i64),
    }

    #[derive(Default)]
    struct Count {
        total: i64,
        seen: Vec<i64>,
    }

    struct CountReducer;

    impl Reducer for CountReducer {
        type State = Count;
        type Action = CountAction;
        type Environment = ();

        fn reduce(
            &self,
            state: &mut Count,
            action: CountAction,
            _env: &(),
        ) -> SmallVec<[Effect<CountAction>; 4]> {
            match action {
                CountAction::Add(n) => {
                    state.total += n;
                    state.seen.push(n);
                    smallvec![Effect::None]
                },
                CountAction::AddLater(n) => smallvec![Effect::Delay {
                    duration: Duration::from_millis(10),
                    action: Box::new(CountAction::Add(n)),
                }],
                CountAction::AddTwice(n) => smallvec![Effect::merge(vec![
                    Effect::Future(Box::pin(async move { Some(CountAction::Add(n)) })),
                    Effect::Future(Box::pin(async move { Some(CountAction::Add(n)) })),
                ])],
                CountAction::AddInOrder(a, b) => smallvec![Effect::chain(vec![
                    Effect::Delay {
                        duration: Duration::from_millis(20),
                        action: Box::new(CountAction::Add(a)),
                    },
                    Effect::Future(Box::pin(async move { Some(CountAction::Add(b)) })),
                ])],
            }
        }
    }

    fn count_store() -> Store<Count, CountAction, (), CountReducer> {
        Store::new(Count::default(), CountReducer, ())
    }

    async fn settle(store: &Store<Count, CountAction, (), CountReducer>) {
        while store.pending_effects() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_send_applies_synchronously() {
        let store = count_store();
        store.send(CountAction::Add(2)).unwrap();
        store.send(CountAction::Add(3)).unwrap();
        assert_eq!(store.state(|s| s.total), 5);
    }

    #[tokio::test]
    async fn test_delay_effect_feeds_back() {
        let store = count_store();
        store.send(CountAction::AddLater(4)).unwrap();
        assert_eq!(store.state(|s| s.total), 0);

        settle(&store).await;
        assert_eq!(store.state(|s| s.total), 4);
    }

    #[tokio::test]
    async fn test_parallel_effects_all_feed_back() {
        let store = count_store();
        store.send(CountAction::AddTwice(3)).unwrap();
        settle(&store).await;
        assert_eq!(store.state(|s| s.total), 6);
    }

    #[tokio::test]
    async fn test_sequential_effects_keep_order() {
        let store = count_store();
        store.send(CountAction::AddInOrder(1, 2)).unwrap();
        settle(&store).await;
        assert_eq!(store.state(|s| s.seen.clone()), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_subscribers_see_every_applied_action() {
        let store = count_store();
        let mut rx = store.subscribe_actions();

        store.send(CountAction::AddLater(1)).unwrap();
        assert_eq!(rx.recv().await.unwrap(), CountAction::AddLater(1));
        assert_eq!(rx.recv().await.unwrap(), CountAction::Add(1));
    }

    #[tokio::test]
    async fn test_send_and_wait_for_feedback_action() {
        let store = count_store();
        let action = store
            .send_and_wait_for(
                CountAction::AddLater(9),
                |a| matches!(a, CountAction::Add(_)),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(action, CountAction::Add(9));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_actions() {
        let store = count_store();
        store.send(CountAction::AddLater(1)).unwrap();

        store.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            store.send(CountAction::Add(1)),
            Err(StoreError::ShutdownInProgress)
        ));
        // The delayed action was fed back after the gate closed.
        assert_eq!(store.state(|s| s.total), 0);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_with_running_effects() {
        let store = count_store();
        store.send(CountAction::AddInOrder(1, 1)).unwrap();

        let result = store.shutdown(Duration::from_millis(1)).await;
        assert!(matches!(result, Err(StoreError::ShutdownTimeout(1))));
    }

    #[test]
    fn test_lifecycle_events_bypass_shutdown_gate() {
        let store = Store::new(StatusTable::default(), RequestsReducer, ());
        store.shutdown.store(true, Ordering::Release);

        store.emit(LifecycleEvent::canceled("late"));
        assert_eq!(store.status("late"), Some(RequestStatus::Canceled));
        assert!(store.send(LifecycleEvent::pending("late")).is_err());
    }
}
