//! Errors delivered through a request's result future.
//!
//! None of these are returned by `dispatch` itself. Operation failures reach
//! callers only through the handle's result and as a `Rejected` lifecycle
//! event, so a caller that never awaits still leaves the table consistent.
//! Cancellation is not an error: a canceled result never settles.

use crate::id::RequestId;
use std::sync::Arc;
use thiserror::Error;

/// Outcome error of a request.
///
/// Cloneable so every deduplicated caller observes the same failure.
#[derive(Error, Debug, Clone)]
pub enum RequestError {
    /// The operation's future completed with an error.
    #[error("request {id} failed: {cause}")]
    OperationFailed {
        /// Identifier of the failed request
        id: RequestId,
        /// Error returned by the operation
        cause: Arc<anyhow::Error>,
    },

    /// The operation factory panicked before producing a future.
    #[error("request {id} factory panicked: {message}")]
    FactoryPanicked {
        /// Identifier of the failed request
        id: RequestId,
        /// Panic payload, when it was a string
        message: String,
    },

    /// The operation's future panicked while running.
    #[error("request {id} operation panicked: {message}")]
    OperationPanicked {
        /// Identifier of the failed request
        id: RequestId,
        /// Panic payload, when it was a string
        message: String,
    },

    /// A run-only-once request was already resolved; nothing ran.
    #[error("request {id} already resolved, dispatch discarded")]
    Discarded {
        /// Identifier of the discarded request
        id: RequestId,
    },
}

impl RequestError {
    /// Wrap an operation error.
    #[must_use]
    pub fn operation(id: RequestId, cause: impl Into<anyhow::Error>) -> Self {
        Self::OperationFailed {
            id,
            cause: Arc::new(cause.into()),
        }
    }

    /// Identifier the error belongs to.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        match self {
            Self::OperationFailed { id, .. }
            | Self::FactoryPanicked { id, .. }
            | Self::OperationPanicked { id, .. }
            | Self::Discarded { id } => id,
        }
    }

    /// The operation's own error, if this is an operation failure.
    #[must_use]
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::OperationFailed { cause, .. } => Some(&**cause),
            _ => None,
        }
    }
}

/// A descriptor that cannot be dispatched.
///
/// Reported synchronously, never through a result future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed request: {reason}")]
pub struct MalformedRequest {
    /// What is missing or invalid
    pub reason: &'static str,
}

/// Render a panic payload caught with `catch_unwind`.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
