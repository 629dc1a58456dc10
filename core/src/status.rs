//! Lifecycle status and the table it is recorded in.
//!
//! Transitions for one handle are `absent → Pending → {Resolved | Rejected | Canceled}`.
//! A new handle for the same identifier (retry or fresh dispatch) starts over
//! at `Pending`.

use crate::event::LifecycleEvent;
use crate::id::RequestId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// The operation is running.
    Pending,
    /// The operation completed successfully.
    Resolved,
    /// The operation failed.
    Rejected,
    /// The caller canceled the request before it settled.
    Canceled,
}

impl RequestStatus {
    /// Whether no further events follow for the handle that reached this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Latest recorded status.
    pub status: RequestStatus,
}

/// Mapping from identifier to its latest lifecycle status.
///
/// Owned by the surrounding store. Entries are created or overwritten by
/// lifecycle events and never deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusTable {
    entries: HashMap<RequestId, StatusEntry>,
}

impl StatusTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event: `table[id] = {status: kind}`, other identifiers untouched.
    pub fn apply(&mut self, event: &LifecycleEvent) {
        self.entries
            .insert(event.id.clone(), StatusEntry { status: event.kind });
    }

    /// Current status for `id`, if it was ever requested.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<RequestStatus> {
        self.entries.get(id).map(|entry| entry.status)
    }

    /// Number of identifiers ever recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all recorded entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&RequestId, &StatusEntry)> {
        self.entries.iter()
    }
}

impl AsRef<StatusTable> for StatusTable {
    fn as_ref(&self) -> &StatusTable {
        self
    }
}

impl<I> FromIterator<(I, RequestStatus)> for StatusTable
where
    I: Into<RequestId>,
{
    fn from_iter<T: IntoIterator<Item = (I, RequestStatus)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(id, status)| (id.into(), StatusEntry { status }))
                .collect(),
        }
    }
}

/// Project the status of `id` out of an optional table.
///
/// Tolerates a missing table and a missing entry, returning `None` for both.
#[must_use]
pub fn status_of(table: Option<&StatusTable>, id: &str) -> Option<RequestStatus> {
    table.and_then(|table| table.get(id))
}

/// Status plus the derived booleans consumers usually branch on.
///
/// Every boolean is `false` when the status is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusView {
    /// Latest status, `None` if never requested.
    pub status: Option<RequestStatus>,
    /// `status == Some(Pending)`
    pub is_pending: bool,
    /// `status == Some(Resolved)`
    pub is_resolved: bool,
    /// `status == Some(Rejected)`
    pub is_rejected: bool,
    /// `status == Some(Canceled)`
    pub is_canceled: bool,
}

impl From<Option<RequestStatus>> for StatusView {
    fn from(status: Option<RequestStatus>) -> Self {
        Self {
            status,
            is_pending: status == Some(RequestStatus::Pending),
            is_resolved: status == Some(RequestStatus::Resolved),
            is_rejected: status == Some(RequestStatus::Rejected),
            is_canceled: status == Some(RequestStatus::Canceled),
        }
    }
}
