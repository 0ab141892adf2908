//! External termination at the permission administrator and its bounded retry.

use super::{SagaContext, moved_on, next_retry_delay, tolerate_conflict};
use crate::retry::RetryPolicy;
use consent_core::environment::{BoxFuture, PermissionAdministrator};
use consent_core::event::PermissionEvent;
use consent_core::event_bus::{EventHandler, HandlerError};
use consent_core::state::{PermissionRequestState, TerminationResult};
use consent_core::stream::{PermissionId, Version};
use std::sync::Arc;

/// `TERMINATED` (and `FULFILLED` when subscribed): the administrator must be told.
pub struct RequireExternalTerminationHandler {
    ctx: SagaContext,
}

impl RequireExternalTerminationHandler {
    const NAME: &'static str = "require-external-termination";

    /// Create a new handler.
    #[must_use]
    pub const fn new(ctx: SagaContext) -> Self {
        Self { ctx }
    }
}

impl EventHandler for RequireExternalTerminationHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle<'a>(&'a self, event: &'a PermissionEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let Some(state) = self.ctx.load(event.permission_id()).await? else {
                return Ok(());
            };
            let ctx = self.ctx.state();
            let result = match state {
                PermissionRequestState::Terminated(terminated) => terminated.require_external_termination(ctx).await,
                PermissionRequestState::Fulfilled(fulfilled) => fulfilled.require_external_termination(ctx).await,
                PermissionRequestState::Unfulfillable(unfulfillable) => {
                    unfulfillable.require_external_termination(ctx).await
                },
                other => {
                    moved_on(Self::NAME, event, &other);
                    return Ok(());
                },
            };
            tolerate_conflict(result, Self::NAME, event).map(drop)
        })
    }
}

/// `REQUIRES_EXTERNAL_TERMINATION`: call the administrator.
pub struct ExternalTerminationHandler {
    ctx: SagaContext,
    administrator: Arc<dyn PermissionAdministrator>,
}

impl ExternalTerminationHandler {
    const NAME: &'static str = "external-termination";

    /// Create a new handler.
    #[must_use]
    pub fn new(ctx: SagaContext, administrator: Arc<dyn PermissionAdministrator>) -> Self {
        Self { ctx, administrator }
    }
}

impl EventHandler for ExternalTerminationHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle<'a>(&'a self, event: &'a PermissionEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let Some(state) = self.ctx.load(event.permission_id()).await? else {
                return Ok(());
            };
            let pending = match state {
                PermissionRequestState::RequiresExternalTermination(pending) => pending,
                other => {
                    moved_on(Self::NAME, event, &other);
                    return Ok(());
                },
            };
            let result = pending
                .terminate_at_permission_administrator(self.ctx.state(), self.administrator.as_ref())
                .await;
            if let Some(TerminationResult::Awaiting(_)) = tolerate_conflict(result, Self::NAME, event)? {
                tracing::info!(
                    permission_id = %event.permission_id(),
                    "Termination requested, waiting for the administrator's acknowledgement"
                );
            }
            Ok(())
        })
    }
}

/// `FAILED_TO_TERMINATE`: go back to `REQUIRES_EXTERNAL_TERMINATION` after a backoff, within budget.
pub struct TerminationRetryHandler {
    ctx: SagaContext,
    policy: RetryPolicy,
}

impl TerminationRetryHandler {
    const NAME: &'static str = "termination-retry";

    /// Create a new handler.
    #[must_use]
    pub const fn new(ctx: SagaContext, policy: RetryPolicy) -> Self {
        Self { ctx, policy }
    }
}

impl EventHandler for TerminationRetryHandler {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn handle<'a>(&'a self, event: &'a PermissionEvent) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let Some(state) = self.ctx.load(event.permission_id()).await? else {
                return Ok(());
            };
            let failed = match state {
                PermissionRequestState::FailedToTerminate(failed) => failed,
                other => {
                    moved_on(Self::NAME, event, &other);
                    return Ok(());
                },
            };
            let Some(delay) = next_retry_delay(
                &self.policy,
                "termination",
                failed.request().termination_failures(),
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
                retry_termination(&ctx, &permission_id, version).await;
            });
            Ok(())
        })
    }
}

async fn retry_termination(ctx: &SagaContext, permission_id: &PermissionId, version: Version) {
    let state = match ctx.load(permission_id).await {
        Ok(Some(state)) => state,
        Ok(None) => return,
        Err(error) => {
            tracing::error!(permission_id = %permission_id, error = %error, "Termination retry could not load request");
            return;
        },
    };
    match state {
        PermissionRequestState::FailedToTerminate(failed) if failed.request().version() == version => {
            match failed.retry(ctx.state()).await {
                Ok(_) => {},
                Err(error) if error.is_conflict() => {
                    tracing::debug!(permission_id = %permission_id, "Termination retry lost a race");
                },
                Err(error) => {
                    tracing::error!(permission_id = %permission_id, error = %error, "Termination retry failed");
                },
            }
        },
        other => {
            tracing::debug!(permission_id = %permission_id, status = %other.status(), "Termination retry superseded");
        },
    }
}
