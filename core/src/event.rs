//! Lifecycle events and the seams they flow through.
//!
//! The request runtime never writes the status table directly. It emits
//! [`LifecycleEvent`]s into a [`LifecycleSink`] (normally the store, which runs
//! them through its reducer) and reads statuses back through a [`StatusSource`].
//!
//! ```text
//! dispatch ──► RequestMiddleware ──emit──► LifecycleSink ──► reducer ──► StatusTable
//!                    ▲                                                      │
//!                    └──────────────── StatusSource (once-gate) ◄───────────┘
//! ```

use crate::id::RequestId;
use crate::status::{RequestStatus, StatusTable};
use serde::{Deserialize, Serialize};

/// Notification of one status transition for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// The status the identifier transitioned to.
    pub kind: RequestStatus,
    /// The identifier that transitioned.
    pub id: RequestId,
}

impl LifecycleEvent {
    /// Create an event of any kind.
    #[must_use]
    pub fn new(kind: RequestStatus, id: impl Into<RequestId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// `Pending` event for `id`.
    #[must_use]
    pub fn pending(id: impl Into<RequestId>) -> Self {
        Self::new(RequestStatus::Pending, id)
    }

    /// `Resolved` event for `id`.
    #[must_use]
    pub fn resolved(id: impl Into<RequestId>) -> Self {
        Self::new(RequestStatus::Resolved, id)
    }

    /// `Rejected` event for `id`.
    #[must_use]
    pub fn rejected(id: impl Into<RequestId>) -> Self {
        Self::new(RequestStatus::Rejected, id)
    }

    /// `Canceled` event for `id`.
    #[must_use]
    pub fn canceled(id: impl Into<RequestId>) -> Self {
        Self::new(RequestStatus::Canceled, id)
    }
}

/// Destination for lifecycle events.
///
/// Implementations must apply events synchronously and in call order: a read
/// through the paired [`StatusSource`] right after `emit` returns observes it.
pub trait LifecycleSink: Send + Sync {
    /// Publish one event.
    fn emit(&self, event: LifecycleEvent);
}

/// Read access to the status table owned by the surrounding store.
pub trait StatusSource: Send + Sync {
    /// Current status of `id`, `None` if never requested.
    fn status(&self, id: &str) -> Option<RequestStatus>;
}

impl StatusSource for StatusTable {
    fn status(&self, id: &str) -> Option<RequestStatus> {
        self.get(id)
    }
}
