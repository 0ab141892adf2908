//! Data reception and fulfillment of accepted permissions.

use super::{SagaContext, moved_on, tolerate_conflict};
use crate::poller::MeterDataPoller;
use consent_core::environment::BoxFuture;
use consent_core::event::PermissionEvent;
use consent_core::event_bus::{EventHandler, HandlerError};
use consent_core::state::PermissionRequestState;
use std::sync::Arc;

/// `ACCEPTED`: ask the meter data source for the permission window.
///
/// Only the first delivery of an `Accepted` event fetches; later fetches are
/// up to the [`MeterDataPoller`].
pub struct AcceptanceHandler {
    ctx: SagaContext,
    poller: Arc<MeterDataPoller>,
}

impl AcceptanceHandler {
    const NAME: &'static str = "acceptance";

    /// Create a new handler.
    #[must_use]
    pub fn new(ctx: SagaContext, poller: Arc<MeterDataPoller>) -> Self {
        Self { ctx, poller }
    }
}

impl EventHandler for AcceptanceHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle<'a>(&'a self, event: &'a PermissionEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let Some(state) = self.ctx.load(event.permission_id()).await? else {
                return Ok(());
            };
            let accepted = match state {
                PermissionRequestState::Accepted(accepted) => accepted,
                other => {
                    moved_on(Self::NAME, event, &other);
                    return Ok(());
                },
            };
            let now = self.ctx.state().clock().now();
            if !self.poller.claim_first(event.permission_id(), now).await {
                tracing::debug!(
                    permission_id = %event.permission_id(),
                    handler = Self::NAME,
                    "Metering data fetch already started, event ignored"
                );
                return Ok(());
            }
            let result = self.poller.fetch(accepted, now).await;
            tolerate_conflict(result, Self::NAME, event).map(drop)
        })
    }
}

/// `DataReceived`: fulfill once the whole window has been delivered.
pub struct DataReceivedHandler {
    ctx: SagaContext,
}

impl DataReceivedHandler {
    const NAME: &'static str = "data-received";

    /// Create a new handler.
    #[must_use]
    pub const fn new(ctx: SagaContext) -> Self {
        Self { ctx }
    }
}

impl EventHandler for DataReceivedHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle<'a>(&'a self, event: &'a PermissionEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let Some(state) = self.ctx.load(event.permission_id()).await? else {
                return Ok(());
            };
            let accepted = match state {
                PermissionRequestState::Accepted(accepted) => accepted,
                other => {
                    moved_on(Self::NAME, event, &other);
                    return Ok(());
                },
            };
            if !accepted.request().is_fully_delivered() {
                return Ok(());
            }
            let result = accepted.fulfill(self.ctx.state()).await;
            tolerate_conflict(result, Self::NAME, event).map(drop)
        })
    }
}
