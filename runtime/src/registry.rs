//! Request registry - identifier → in-flight handle.
//!
//! The registry enforces the dedup invariant: at most one active handle per
//! identifier. It is owned by one [`RequestMiddleware`](crate::RequestMiddleware)
//! and only touched while the middleware's control lock is held, so
//! admission, creation and registration are one atomic step.
//!
//! ## Rules
//! - `admit` returns the active handle for an identifier, if any
//! - `register` stores a freshly created handle under a new generation
//! - `release` removes an entry only when the generation still matches, so a
//!   handle that was canceled and replaced can never evict its successor

use crate::error::DispatchError;
use crate::handle::RequestHandle;
use composable_requests_core::RequestId;
use std::any::Any;
use std::collections::HashMap;

/// Monotonic counter distinguishing successive handles for one identifier.
pub type Generation = u64;

struct Entry {
    generation: Generation,
    handle: Box<dyn Any + Send + Sync>,
}

/// Mapping from identifier to the active request handle.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<RequestId, Entry>,
    next_generation: Generation,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the active handle for `id`.
    ///
    /// `Ok(None)` means the caller should create a handle and [`register`](Self::register) it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::OutputMismatch`] when `id` is active with a
    /// different output type.
    pub fn admit<T>(&self, id: &str) -> Result<Option<RequestHandle<T>>, DispatchError>
    where
        T: Send + Sync + 'static,
    {
        let Some(entry) = self.entries.get(id) else {
            return Ok(None);
        };

        entry
            .handle
            .downcast_ref::<RequestHandle<T>>()
            .map(|handle| Some(handle.clone()))
            .ok_or_else(|| DispatchError::OutputMismatch {
                id: RequestId::from(id),
            })
    }

    /// Reserve the generation for the next handle.
    pub const fn next_generation(&mut self) -> Generation {
        self.next_generation += 1;
        self.next_generation
    }

    /// Store `handle` as the active request for its identifier.
    pub fn register<T>(&mut self, handle: RequestHandle<T>)
    where
        T: Send + Sync + 'static,
    {
        let id = handle.id().clone();
        let generation = handle.generation();
        self.entries.insert(
            id,
            Entry {
                generation,
                handle: Box::new(handle),
            },
        );
    }

    /// Remove the entry for `id` if it still belongs to `generation`.
    ///
    /// Returns whether an entry was removed.
    pub fn release(&mut self, id: &str, generation: Generation) -> bool {
        match self.entries.get(id) {
            Some(entry) if entry.generation == generation => {
                self.entries.remove(id);
                true
            },
            _ => false,
        }
    }

    /// Whether `id` currently has an active handle.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of active handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("active", &self.entries.keys().collect::<Vec<_>>())
            .field("next_generation", &self.next_generation)
            .finish()
    }
}
