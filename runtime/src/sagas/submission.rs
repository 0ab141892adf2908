//! Submission to the permission administrator and its bounded retry.

use super::{SagaContext, moved_on, next_retry_delay, tolerate_conflict};
use crate::retry::RetryPolicy;
use consent_core::environment::{BoxFuture, PermissionAdministrator};
use consent_core::error::StateError;
use consent_core::event::{EventPayload, PermissionEvent};
use consent_core::event_bus::{EventHandler, HandlerError};
use consent_core::state::PermissionRequestState;
use consent_core::stream::{PermissionId, Version};
use std::sync::Arc;

/// `VALIDATED`: submit the request.
pub struct SendHandler {
    ctx: SagaContext,
    administrator: Arc<dyn PermissionAdministrator>,
}

impl SendHandler {
    const NAME: &'static str = "send";

    /// Create a new handler.
    #[must_use]
    pub fn new(ctx: SagaContext, administrator: Arc<dyn PermissionAdministrator>) -> Self {
        Self { ctx, administrator }
    }
}

impl EventHandler for SendHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle<'a>(&'a self, event: &'a PermissionEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let Some(state) = self.ctx.load(event.permission_id()).await? else {
                return Ok(());
            };
            let validated = match state {
                PermissionRequestState::Validated(validated) => validated,
                other => {
                    moved_on(Self::NAME, event, &other);
                    return Ok(());
                },
            };

            let result = validated
                .send_to_permission_administrator(self.ctx.state(), self.administrator.as_ref())
                .await;
            match result {
                // The failure is already committed as UNABLE_TO_SEND.
                Err(StateError::Submission { .. }) => Ok(()),
                other => tolerate_conflict(other, Self::NAME, event).map(drop),
            }
        })
    }
}

/// `UNABLE_TO_SEND`: go back to `VALIDATED` after a backoff, within budget.
pub struct SendRetryHandler {
    ctx: SagaContext,
    policy: RetryPolicy,
}

impl SendRetryHandler {
    const NAME: &'static str = "send-retry";

    /// Create a new handler.
    #[must_use]
    pub const fn new(ctx: SagaContext, policy: RetryPolicy) -> Self {
        Self { ctx, policy }
    }
}

impl EventHandler for SendRetryHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle<'a>(&'a self, event: &'a PermissionEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            if let EventPayload::UnableToSend {
                caller_fault: true,
                cause,
            } = event.payload()
            {
                tracing::info!(
                    permission_id = %event.permission_id(),
                    cause = %cause,
                    "Submission rejected by the permission administrator, not retried"
                );
                return Ok(());
            }

            let Some(state) = self.ctx.load(event.permission_id()).await? else {
                return Ok(());
            };
            let failed = match state {
                PermissionRequestState::UnableToSend(failed) => failed,
                other => {
                    moved_on(Self::NAME, event, &other);
                    return Ok(());
                },
            };
            let Some(delay) = next_retry_delay(
                &self.policy,
                "send",
                failed.request().send_failures(),
                event.permission_id(),
            ) else {
                return Ok(());
            };

            let ctx = self.ctx.clone();
            let guard = ctx.track();
            let permission_id = event.permission_id().clone();
            let version = failed.request().version();
            tokio::spawn(async move {
                let _guard = guard;
                tokio::time::sleep(delay).await;
                retry_send(&ctx, &permission_id, version).await;
            });
            Ok(())
        })
    }
}

async fn retry_send(ctx: &SagaContext, permission_id: &PermissionId, version: Version) {
    let state = match ctx.load(permission_id).await {
        Ok(Some(state)) => state,
        Ok(None) => return,
        Err(error) => {
            tracing::error!(permission_id = %permission_id, error = %error, "Send retry could not load request");
            return;
        },
    };
    match state {
        PermissionRequestState::UnableToSend(failed) if failed.request().version() == version => {
            match failed.retry(ctx.state()).await {
                Ok(_) => {},
                Err(error) if error.is_conflict() => {
                    tracing::debug!(permission_id = %permission_id, "Send retry lost a race");
                },
                Err(error) => {
                    tracing::error!(permission_id = %permission_id, error = %error, "Send retry failed");
                },
            }
        },
        other => {
            tracing::debug!(permission_id = %permission_id, status = %other.status(), "Send retry superseded");
        },
    }
}
