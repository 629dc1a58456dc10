//! # Composable Requests Core
//!
//! Core traits and types for tracking asynchronous requests in a reducer store.
//!
//! A *request* is an arbitrary async operation keyed by an identifier. The
//! runtime crate guarantees at most one in-flight operation per identifier and
//! publishes every lifecycle transition as a [`LifecycleEvent`]. This crate holds
//! the pieces that have no runtime attached:
//!
//! - **Status**: [`RequestStatus`] and the [`StatusTable`] it is recorded in
//! - **Projection**: [`status_of`] and [`StatusView`] for reading the table
//! - **Lifecycle**: [`LifecycleEvent`] plus the [`LifecycleSink`] / [`StatusSource`] seams
//! - **Descriptor**: [`RequestDescriptor`], the caller's submission
//! - **Reducer**: the [`Reducer`](reducer::Reducer) trait and [`RequestsReducer`]
//! - **Effect**: side effect descriptions executed by the runtime
//!
//! ## Example
//!
//! ```
//! use composable_requests_core::{
//!     LifecycleEvent, RequestStatus, RequestsReducer, StatusTable, reducer::Reducer, status_of,
//! };
//!
//! let mut table = StatusTable::default();
//! let _ = RequestsReducer.reduce(&mut table, LifecycleEvent::pending("users"), &());
//! let _ = RequestsReducer.reduce(&mut table, LifecycleEvent::resolved("users"), &());
//!
//! assert_eq!(status_of(Some(&table), "users"), Some(RequestStatus::Resolved));
//! assert_eq!(status_of(Some(&table), "posts"), None);
//! ```

// Re-export commonly used types
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

/// Request identifiers
pub mod id;

/// Lifecycle status and the status table
pub mod status;

/// Lifecycle events and the seams they flow through
pub mod event;

/// Request descriptors submitted by callers
pub mod descriptor;

/// Errors delivered through a request's result future
pub mod error;

/// Reducer composition utilities
pub mod composition;

pub use descriptor::{DescriptorBuilder, OperationFactory, RequestDescriptor};
pub use error::{MalformedRequest, RequestError};
pub use event::{LifecycleEvent, LifecycleSink, StatusSource};
pub use id::RequestId;
pub use reducer::RequestsReducer;
pub use status::{RequestStatus, StatusEntry, StatusTable, StatusView, status_of};

/// Reducer module - The core trait for state transitions
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`
///
/// The request runtime does not own application state. It publishes lifecycle
/// events, and a reducer (usually [`RequestsReducer`] mounted somewhere in the
/// application state) records them.
pub mod reducer {
    use super::effect::Effect;
    use super::{LifecycleEvent, SmallVec, StatusTable};

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for ProfileReducer {
    ///     type State = ProfileState;
    ///     type Action = ProfileAction;
    ///     type Environment = ();
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut ProfileState,
    ///         action: ProfileAction,
    ///         _env: &(),
    ///     ) -> SmallVec<[Effect<ProfileAction>; 4]> {
    ///         match action {
    ///             ProfileAction::Rename(name) => {
    ///                 state.name = name;
    ///                 smallvec![Effect::None]
    ///             }
    ///         }
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// Updates state in place and returns effect descriptions for the
        /// runtime to execute.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }

    /// Records lifecycle events into a [`StatusTable`].
    ///
    /// Each event overwrites the entry for its identifier; every other
    /// identifier is preserved. Entries are never removed, so absence means
    /// "never requested". No effects are produced.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RequestsReducer;

    impl Reducer for RequestsReducer {
        type State = StatusTable;
        type Action = LifecycleEvent;
        type Environment = ();

        fn reduce(
            &self,
            state: &mut StatusTable,
            action: LifecycleEvent,
            _env: &(),
        ) -> SmallVec<[Effect<LifecycleEvent>; 4]> {
            state.apply(&action);
            SmallVec::new()
        }
    }
}

/// Effect module - Side effect descriptions
///
/// Effects describe side effects to be performed by the runtime.
/// They are values (not execution) and are composable.
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed immediately. They are descriptions of what should happen,
    /// returned from reducers and executed by the Store runtime.
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Lift an effect into a wider action type
        ///
        /// Used when a sub-reducer is mounted into a larger application state.
        #[must_use]
        pub fn map<B, F>(self, f: F) -> Effect<B>
        where
            F: Fn(Action) -> B + Clone + Send + 'static,
            Action: 'static,
            B: 'static,
        {
            match self {
                Effect::None => Effect::None,
                Effect::Parallel(effects) => {
                    Effect::Parallel(effects.into_iter().map(|e| e.map(f.clone())).collect())
                },
                Effect::Sequential(effects) => {
                    Effect::Sequential(effects.into_iter().map(|e| e.map(f.clone())).collect())
                },
                Effect::Delay { duration, action } => Effect::Delay {
                    duration,
                    action: Box::new(f(*action)),
                },
                Effect::Future(fut) => Effect::Future(Box::pin(async move { fut.await.map(f) })),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use super::reducer::Reducer;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_requests_reducer_records_and_never_emits() {
        let mut table = StatusTable::default();

        let effects = RequestsReducer.reduce(&mut table, LifecycleEvent::pending("alpha"), &());
        assert!(effects.is_empty());
        assert_eq!(table.get("alpha"), Some(RequestStatus::Pending));

        let _ = RequestsReducer.reduce(&mut table, LifecycleEvent::rejected("alpha"), &());
        assert_eq!(table.get("alpha"), Some(RequestStatus::Rejected));
    }

    #[tokio::test]
    async fn test_effect_map_lifts_future_output() {
        let effect: Effect<u8> = Effect::Future(Box::pin(async { Some(2) }));
        let Effect::Future(fut) = effect.map(|n| u32::from(n) * 10) else {
            unreachable!("map preserves the variant");
        };
        assert_eq!(fut.await, Some(20));
    }

    #[test]
    fn test_effect_map_lifts_delay_action() {
        let effect: Effect<u8> = Effect::Delay {
            duration: Duration::from_millis(5),
            action: Box::new(7),
        };
        match effect.map(|n| format!("n={n}")) {
            Effect::Delay { duration, action } => {
                assert_eq!(duration, Duration::from_millis(5));
                assert_eq!(*action, "n=7");
            },
            other => unreachable!("unexpected effect {other:?}"),
        }
    }
}
