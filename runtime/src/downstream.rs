//! Forwarding admitted handles to the next stage.
//!
//! After admission the middleware hands every admitted handle (fresh or
//! deduplicated) to a [`Downstream`]. Dispatches dropped by the run-only-once
//! gate are not forwarded.

use crate::handle::RequestHandle;
use composable_requests_core::{RequestError, RequestId};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::mpsc;

/// Outcome future of a forwarded handle, with the value erased.
pub type ForwardedOutcome = Shared<BoxFuture<'static, Result<(), RequestError>>>;

/// What the next stage receives for each admitted dispatch.
#[derive(Clone)]
pub struct Forwarded {
    /// The request identifier
    pub id: RequestId,
    /// Whether the dispatch joined an already active handle
    pub deduplicated: bool,
    /// Settles with the handle's outcome; never settles if it is canceled
    pub settled: ForwardedOutcome,
}

impl Forwarded {
    pub(crate) fn from_handle<T>(handle: &RequestHandle<T>, deduplicated: bool) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            id: handle.id().clone(),
            deduplicated,
            settled: handle.result().map(|outcome| outcome.map(|_| ())).boxed().shared(),
        }
    }
}

impl std::fmt::Debug for Forwarded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarded")
            .field("id", &self.id)
            .field("deduplicated", &self.deduplicated)
            .finish_non_exhaustive()
    }
}

/// The next stage of the dispatch pipeline.
///
/// Called outside the middleware's control lock, so implementations may
/// dispatch again.
pub trait Downstream: Send + Sync {
    /// Receive one admitted dispatch.
    fn forward(&self, forwarded: Forwarded);
}

/// Discards everything. The default downstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDownstream;

impl Downstream for NoDownstream {
    fn forward(&self, _forwarded: Forwarded) {}
}

/// Sends every admitted dispatch into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDownstream {
    sender: mpsc::UnboundedSender<Forwarded>,
}

impl ChannelDownstream {
    /// Create the downstream and the receiving end.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Forwarded>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Downstream for ChannelDownstream {
    fn forward(&self, forwarded: Forwarded) {
        if self.sender.send(forwarded).is_err() {
            tracing::trace!("Downstream receiver dropped, forward ignored");
        }
    }
}

/// Blanket impl so closures can act as a downstream.
impl<F> Downstream for F
where
    F: Fn(Forwarded) + Send + Sync,
{
    fn forward(&self, forwarded: Forwarded) {
        self(forwarded);
    }
}
