//! Request descriptors.
//!
//! A descriptor is what a caller submits: an identifier, a factory producing
//! the async operation, and the run-only-once flag. It is immutable once built
//! and cheap to clone, which is what lets a handle resubmit it on retry.

use crate::error::MalformedRequest;
use crate::id::RequestId;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future produced by an operation factory.
pub type OperationFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

/// Factory invoked once per admitted request to start the operation.
pub type OperationFactory<T> = Arc<dyn Fn() -> OperationFuture<T> + Send + Sync>;

/// Caller input: `{ id, operation, run_only_once }`.
///
/// # Example
///
/// ```
/// use composable_requests_core::RequestDescriptor;
///
/// let descriptor = RequestDescriptor::new("profile", || async {
///     Ok::<_, std::io::Error>(String::from("ada"))
/// })
/// .run_only_once(true);
///
/// assert_eq!(descriptor.id().as_str(), "profile");
/// assert!(descriptor.is_run_only_once());
/// ```
pub struct RequestDescriptor<T> {
    id: RequestId,
    operation: OperationFactory<T>,
    run_only_once: bool,
}

impl<T> RequestDescriptor<T>
where
    T: Send + 'static,
{
    /// Describe a request from an identifier and an operation factory.
    ///
    /// The factory is not called here; the runtime calls it at most once per
    /// admitted handle.
    pub fn new<F, Fut, E>(id: impl Into<RequestId>, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        Self {
            id: id.into(),
            operation: boxed_factory(operation),
            run_only_once: false,
        }
    }

    /// Start a builder, for call sites that assemble descriptors piecemeal.
    #[must_use]
    pub const fn builder() -> DescriptorBuilder<T> {
        DescriptorBuilder {
            id: None,
            operation: None,
            run_only_once: false,
        }
    }
}

impl<T> RequestDescriptor<T> {
    /// Discard dispatches once the identifier is recorded as resolved.
    #[must_use]
    pub const fn run_only_once(mut self, enabled: bool) -> Self {
        self.run_only_once = enabled;
        self
    }

    /// The request identifier.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// Whether the run-only-once gate applies.
    #[must_use]
    pub const fn is_run_only_once(&self) -> bool {
        self.run_only_once
    }

    /// The operation factory.
    #[must_use]
    pub const fn operation(&self) -> &OperationFactory<T> {
        &self.operation
    }

    /// Check the descriptor can be dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedRequest`] when the identifier is empty or blank.
    pub fn validate(&self) -> Result<(), MalformedRequest> {
        if self.id.is_valid() {
            Ok(())
        } else {
            Err(MalformedRequest {
                reason: "request identifier must be a non-blank string",
            })
        }
    }
}

impl<T> Clone for RequestDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            operation: Arc::clone(&self.operation),
            run_only_once: self.run_only_once,
        }
    }
}

impl<T> fmt::Debug for RequestDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("id", &self.id)
            .field("run_only_once", &self.run_only_once)
            .finish_non_exhaustive()
    }
}

/// Incremental construction of a [`RequestDescriptor`].
pub struct DescriptorBuilder<T> {
    id: Option<RequestId>,
    operation: Option<OperationFactory<T>>,
    run_only_once: bool,
}

impl<T> DescriptorBuilder<T>
where
    T: Send + 'static,
{
    /// Set the identifier.
    #[must_use]
    pub fn id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the operation factory.
    #[must_use]
    pub fn operation<F, Fut, E>(mut self, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        self.operation = Some(boxed_factory(operation));
        self
    }

    /// Set the run-only-once flag.
    #[must_use]
    pub const fn run_only_once(mut self, enabled: bool) -> Self {
        self.run_only_once = enabled;
        self
    }

    /// Finish the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedRequest`] when the identifier or operation is missing,
    /// or the identifier is blank.
    pub fn build(self) -> Result<RequestDescriptor<T>, MalformedRequest> {
        let id = self.id.ok_or(MalformedRequest {
            reason: "request identifier is missing",
        })?;
        let operation = self.operation.ok_or(MalformedRequest {
            reason: "request operation is missing",
        })?;

        let descriptor = RequestDescriptor {
            id,
            operation,
            run_only_once: self.run_only_once,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

fn boxed_factory<T, F, Fut, E>(operation: F) -> OperationFactory<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    Arc::new(move || {
        let fut = operation();
        Box::pin(async move { fut.await.map_err(Into::into) }) as OperationFuture<T>
    })
}
