//! Request identifiers.
//!
//! An identifier names a logical request. Deduplication and status tracking
//! are both scoped to it.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Caller-chosen key identifying a logical request.
///
/// # Example
///
/// ```
/// use composable_requests_core::RequestId;
///
/// let id = RequestId::from("load-profile");
/// assert_eq!(id.as_str(), "load-profile");
/// assert!(id.is_valid());
/// assert!(!RequestId::from("  ").is_valid());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Create an identifier from anything string-like.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier can key a request (non-empty, not only whitespace).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&RequestId> for RequestId {
    fn from(id: &RequestId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
