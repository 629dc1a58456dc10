//! Waiting for status changes of one identifier.
//!
//! A [`StatusWatch`] follows the store's action stream and re-reads the
//! status after each applied action. It is how a consumer "re-renders" when
//! a request it displays changes state.

use crate::error::StoreError;
use composable_requests_core::{RequestId, RequestStatus, StatusSource, StatusView};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Observer of one identifier's status.
///
/// Created by [`Store::watch_status`](crate::Store::watch_status).
///
/// ```ignore
/// let mut watch = store.watch_status("users");
/// let view = watch.wait_for(|view| !view.is_pending).await?;
/// ```
pub struct StatusWatch<A> {
    id: RequestId,
    source: Arc<dyn StatusSource>,
    actions: broadcast::Receiver<A>,
    last: Option<RequestStatus>,
}

impl<A> StatusWatch<A>
where
    A: Clone,
{
    pub(crate) fn new(
        id: RequestId,
        source: Arc<dyn StatusSource>,
        actions: broadcast::Receiver<A>,
    ) -> Self {
        let last = source.status(id.as_str());
        Self {
            id,
            source,
            actions,
            last,
        }
    }

    /// The watched identifier.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// The status last observed by this watch.
    #[must_use]
    pub fn current(&self) -> StatusView {
        StatusView::from(self.last)
    }

    /// Wait until the status differs from the last observed one.
    ///
    /// Intermediate statuses applied in quick succession may be skipped; the
    /// returned view is the latest.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ChannelClosed`] once every store clone is gone.
    pub async fn changed(&mut self) -> Result<StatusView, StoreError> {
        loop {
            match self.actions.recv().await {
                Ok(_) => {},
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::trace!(id = %self.id, skipped, "Status watch lagged");
                },
                Err(broadcast::error::RecvError::Closed) => return Err(StoreError::ChannelClosed),
            }

            let status = self.source.status(self.id.as_str());
            if status != self.last {
                self.last = status;
                return Ok(StatusView::from(status));
            }
        }
    }

    /// Wait until `predicate` holds for the status, checking the current one first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ChannelClosed`] once every store clone is gone.
    pub async fn wait_for<F>(&mut self, predicate: F) -> Result<StatusView, StoreError>
    where
        F: Fn(&StatusView) -> bool,
    {
        let current = self.current();
        if predicate(&current) {
            return Ok(current);
        }

        loop {
            let view = self.changed().await?;
            if predicate(&view) {
                return Ok(view);
            }
        }
    }
}

impl<A> std::fmt::Debug for StatusWatch<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWatch")
            .field("id", &self.id)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}
