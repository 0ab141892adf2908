//! Saga handlers driving permission requests through their lifecycle.
//!
//! Each handler subscribes to one event kind, loads the current projection of
//! the request, and acts only if the request is still in the status the event
//! announced. Duplicate or late deliveries therefore find the request moved on
//! and do nothing. A lost race against another writer (a
//! [`StatusConflict`](consent_core::error::OutboxError::StatusConflict)) is
//! expected and logged at `debug`.
//!
//! | Event | Handler | Follow-up |
//! |---|---|---|
//! | `Validated` | [`SendHandler`] | `Sent` / `UnableToSend` |
//! | `UnableToSend` | [`SendRetryHandler`] | `Validated` after backoff |
//! | `Accepted` | [`AcceptanceHandler`] | `DataReceived` / `Unfulfillable` |
//! | `DataReceived` | [`DataReceivedHandler`] | `Fulfilled` |
//! | `Terminated`, `Fulfilled` | [`RequireExternalTerminationHandler`] | `RequiresExternalTermination` |
//! | `RequiresExternalTermination` | [`ExternalTerminationHandler`] | `ExternallyTerminated` / `FailedToTerminate` |
//! | `FailedToTerminate` | [`TerminationRetryHandler`] | `RequiresExternalTermination` after backoff |

mod fulfillment;
mod submission;
mod termination;

pub use fulfillment::{AcceptanceHandler, DataReceivedHandler};
pub use submission::{SendHandler, SendRetryHandler};
pub use termination::{ExternalTerminationHandler, RequireExternalTerminationHandler, TerminationRetryHandler};

use crate::metrics::SagaMetrics;
use crate::retry::RetryPolicy;
use crate::tracking::{InFlight, InFlightGuard};
use consent_core::error::StateError;
use consent_core::event::{Event, PermissionEvent};
use consent_core::event_bus::HandlerError;
use consent_core::repository::PermissionRequestRepository;
use consent_core::state::{PermissionRequestState, StateContext};
use consent_core::stream::PermissionId;
use std::sync::Arc;
use std::time::Duration;

/// What every saga handler needs.
#[derive(Clone)]
pub struct SagaContext {
    state: StateContext,
    repository: Arc<dyn PermissionRequestRepository>,
    in_flight: InFlight,
}

impl SagaContext {
    /// Create a new context.
    #[must_use]
    pub fn new(state: StateContext, repository: Arc<dyn PermissionRequestRepository>, in_flight: InFlight) -> Self {
        Self {
            state,
            repository,
            in_flight,
        }
    }

    /// Context for state operations.
    #[must_use]
    pub const fn state(&self) -> &StateContext {
        &self.state
    }

    /// Keep the engine from settling until the guard is dropped.
    #[must_use]
    pub fn track(&self) -> InFlightGuard {
        self.in_flight.track()
    }

    /// Current state of `permission_id`, or `None` if nothing is projected.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Store`] if the repository fails.
    pub async fn load(&self, permission_id: &PermissionId) -> Result<Option<PermissionRequestState>, HandlerError> {
        let request = self.repository.find_by_permission_id(permission_id).await?;
        if request.is_none() {
            tracing::debug!(permission_id = %permission_id, "No projection for permission request");
        }
        Ok(request.map(PermissionRequestState::from_request))
    }
}

impl std::fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaContext")
            .field("in_flight", &self.in_flight.pending())
            .finish_non_exhaustive()
    }
}

/// Turn a lost race into a quiet no-op.
pub(crate) fn tolerate_conflict<T>(
    result: Result<T, StateError>,
    handler: &'static str,
    event: &PermissionEvent,
) -> Result<Option<T>, HandlerError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.is_conflict() => {
            tracing::debug!(
                permission_id = %event.permission_id(),
                event_type = event.event_type(),
                handler,
                error = %error,
                "Another writer got there first"
            );
            Ok(None)
        },
        Err(error) => Err(error.into()),
    }
}

/// Log that the request already moved past the status of `event`.
pub(crate) fn moved_on(handler: &'static str, event: &PermissionEvent, state: &PermissionRequestState) {
    tracing::debug!(
        permission_id = %event.permission_id(),
        event_type = event.event_type(),
        handler,
        status = %state.status(),
        "Permission request moved on, event ignored"
    );
}

/// Delay before the next attempt of `retry_loop`, or `None` once the budget is spent.
pub(crate) fn next_retry_delay(
    policy: &RetryPolicy,
    retry_loop: &'static str,
    failures: u32,
    permission_id: &PermissionId,
) -> Option<Duration> {
    let attempt = failures.saturating_sub(1);
    if policy.should_retry(attempt) {
        SagaMetrics::record_retry(retry_loop);
        let delay = policy.delay_for_attempt(attempt);
        tracing::info!(
            permission_id = %permission_id,
            retry_loop,
            attempt = attempt + 1,
            max_attempts = policy.max_attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling retry"
        );
        Some(delay)
    } else {
        SagaMetrics::record_exhausted(retry_loop);
        tracing::error!(
            permission_id = %permission_id,
            retry_loop,
            failures,
            "Retry budget exhausted, permission request stays in its failure status"
        );
        None
    }
}
