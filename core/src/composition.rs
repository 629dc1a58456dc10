//! Reducer composition utilities
//!
//! - **`combine_reducers`**: Run multiple reducers on the same state/action
//! - **`scope_reducer`**: Mount a reducer on a slice of a larger state
//!
//! The usual use is mounting [`RequestsReducer`](crate::RequestsReducer) under
//! a field of the application state, so lifecycle events land in
//! `state.requests` while the rest of the application reducer stays unaware of
//! them.
//!
//! # Example
//!
//! ```
//! use composable_requests_core::composition::scope_reducer;
//! use composable_requests_core::reducer::Reducer;
//! use composable_requests_core::{LifecycleEvent, RequestStatus, RequestsReducer, StatusTable};
//!
//! #[derive(Default)]
//! struct AppState {
//!     requests: StatusTable,
//! }
//!
//! #[derive(Clone)]
//! enum AppAction {
//!     Request(LifecycleEvent),
//!     Other,
//! }
//!
//! fn requests(state: &mut AppState) -> &mut StatusTable {
//!     &mut state.requests
//! }
//!
//! fn lifecycle(action: AppAction) -> Option<LifecycleEvent> {
//!     match action {
//!         AppAction::Request(event) => Some(event),
//!         AppAction::Other => None,
//!     }
//! }
//!
//! let reducer = scope_reducer(RequestsReducer, requests, lifecycle, AppAction::Request);
//!
//! let mut state = AppState::default();
//! let _ = reducer.reduce(&mut state, AppAction::Request(LifecycleEvent::pending("a")), &());
//! let _ = reducer.reduce(&mut state, AppAction::Other, &());
//! assert_eq!(state.requests.get("a"), Some(RequestStatus::Pending));
//! ```

use crate::SmallVec;
use crate::effect::Effect;
use crate::reducer::Reducer;

/// Combines multiple reducers that operate on the same state and action types.
///
/// Each reducer is run in sequence, and all effects are collected and concatenated.
#[must_use]
pub fn combine_reducers<S, A, E>(
    reducers: Vec<Box<dyn Reducer<State = S, Action = A, Environment = E> + Send + Sync>>,
) -> CombinedReducer<S, A, E>
where
    S: 'static,
    A: Clone + 'static,
    E: 'static,
{
    CombinedReducer { reducers }
}

/// A reducer that combines multiple reducers.
///
/// Created by [`combine_reducers`].
pub struct CombinedReducer<S, A, E>
where
    S: 'static,
    A: Clone + 'static,
    E: 'static,
{
    reducers: Vec<Box<dyn Reducer<State = S, Action = A, Environment = E> + Send + Sync>>,
}

impl<S, A, E> Reducer for CombinedReducer<S, A, E>
where
    S: 'static,
    A: Clone + 'static,
    E: 'static,
{
    type State = S;
    type Action = A;
    type Environment = E;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let mut all_effects = SmallVec::new();

        for reducer in &self.reducers {
            let effects = reducer.reduce(state, action.clone(), env);
            all_effects.extend(effects);
        }

        all_effects
    }
}

/// Mounts a reducer on a slice of a larger state.
///
/// - `lens` borrows the sub-state out of the parent state
/// - `extract` picks the sub-action out of a parent action (`None` skips the reducer)
/// - `embed` lifts sub-actions produced by effects back into parent actions
///
/// The sub-reducer must not need an environment.
#[must_use]
pub const fn scope_reducer<S, SubS, A, SubA, R>(
    reducer: R,
    lens: fn(&mut S) -> &mut SubS,
    extract: fn(A) -> Option<SubA>,
    embed: fn(SubA) -> A,
) -> ScopedReducer<S, SubS, A, SubA, R>
where
    R: Reducer<State = SubS, Action = SubA, Environment = ()>,
{
    ScopedReducer {
        reducer,
        lens,
        extract,
        embed,
    }
}

/// A reducer that focuses on a slice of state.
///
/// Created by [`scope_reducer`].
pub struct ScopedReducer<S, SubS, A, SubA, R>
where
    R: Reducer<State = SubS, Action = SubA, Environment = ()>,
{
    reducer: R,
    lens: fn(&mut S) -> &mut SubS,
    extract: fn(A) -> Option<SubA>,
    embed: fn(SubA) -> A,
}

impl<S, SubS, A, SubA, R> Reducer for ScopedReducer<S, SubS, A, SubA, R>
where
    R: Reducer<State = SubS, Action = SubA, Environment = ()>,
    A: 'static,
    SubA: 'static,
{
    type State = S;
    type Action = A;
    type Environment = ();

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let Some(sub_action) = (self.extract)(action) else {
            return SmallVec::new();
        };

        let embed = self.embed;
        self.reducer
            .reduce((self.lens)(state), sub_action, env)
            .into_iter()
            .map(|effect| effect.map(embed))
            .collect()
    }
}
