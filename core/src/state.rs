//! Capability-restricted views of a permission request.
//!
//! Every lifecycle status has its own type that exposes only the operations
//! legal in that status. Operations consume the value, commit the follow-up
//! event through the [`Outbox`] with a compare-and-swap on the current status,
//! and return the type of the next status. Calling `accept()` on a request
//! that was never sent does not compile.
//!
//! ```
//! # use consent_core::state::{PermissionRequestState, StateContext};
//! # async fn example(ctx: &StateContext, state: PermissionRequestState) -> Result<(), consent_core::error::StateError> {
//! match state {
//!     PermissionRequestState::Sent(sent) => {
//!         let accepted = sent.accept(ctx, None).await?;
//!         let _terminated = accepted.terminate(ctx, Some("customer left".into())).await?;
//!     },
//!     other => tracing::debug!(status = %other.status(), "Nothing to do"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::environment::{Clock, PermissionAdministrator, TerminationOutcome};
use crate::error::{AttributeError, OutboxError, StateError};
use crate::event::{EventPayload, PermissionEvent};
use crate::outbox::Outbox;
use crate::request::{NewPermissionRequest, PermissionRequest};
use crate::status::PermissionProcessStatus;
use crate::stream::PermissionId;
use crate::validation::{END, ValidationContext, ValidatorSet};
use chrono::NaiveDate;
use std::fmt;
use std::sync::Arc;

/// Collaborators every state operation needs: where to commit and what time it is.
#[derive(Clone)]
pub struct StateContext {
    outbox: Arc<dyn Outbox>,
    clock: Arc<dyn Clock>,
}

impl StateContext {
    /// Create a new context.
    #[must_use]
    pub fn new(outbox: Arc<dyn Outbox>, clock: Arc<dyn Clock>) -> Self {
        Self { outbox, clock }
    }

    /// The outbox operations commit through.
    #[must_use]
    pub fn outbox(&self) -> &Arc<dyn Outbox> {
        &self.outbox
    }

    /// The clock stamping new events.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn commit(
        &self,
        request: &PermissionRequest,
        payload: EventPayload,
    ) -> Result<PermissionRequest, OutboxError> {
        let event = PermissionEvent::new(request.permission_id().clone(), payload, self.clock.now());
        self.outbox
            .commit_expecting(Some(request.status()), event)
            .await
    }
}

impl fmt::Debug for StateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateContext").finish_non_exhaustive()
    }
}

macro_rules! state_variants {
    ($($(#[$doc:meta])* $name:ident => $status:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Clone, Debug, PartialEq)]
            pub struct $name {
                request: PermissionRequest,
            }

            impl $name {
                /// The status this type stands for.
                pub const STATUS: PermissionProcessStatus = PermissionProcessStatus::$status;

                /// Read-only view of the aggregate.
                #[must_use]
                pub const fn request(&self) -> &PermissionRequest {
                    &self.request
                }

                /// Give up the capabilities and keep the data.
                #[must_use]
                pub fn into_request(self) -> PermissionRequest {
                    self.request
                }
            }
        )*

        /// A permission request together with the capabilities of its status.
        #[derive(Clone, Debug, PartialEq)]
        pub enum PermissionRequestState {
            $(
                $(#[$doc])*
                $name($name),
            )*
        }

        impl PermissionRequestState {
            /// Wrap a projection in the variant matching its status.
            #[must_use]
            pub fn from_request(request: PermissionRequest) -> Self {
                match request.status() {
                    $(PermissionProcessStatus::$status => Self::$name($name { request }),)*
                }
            }

            /// Current status.
            #[must_use]
            pub const fn status(&self) -> PermissionProcessStatus {
                match self {
                    $(Self::$name(_) => PermissionProcessStatus::$status,)*
                }
            }

            /// Read-only view of the aggregate.
            #[must_use]
            pub const fn request(&self) -> &PermissionRequest {
                match self {
                    $(Self::$name(state) => &state.request,)*
                }
            }

            /// Give up the capabilities and keep the data.
            #[must_use]
            pub fn into_request(self) -> PermissionRequest {
                match self {
                    $(Self::$name(state) => state.request,)*
                }
            }
        }
    };
}

state_variants! {
    /// `CREATED`: waiting for validation.
    Created => Created,
    /// `VALIDATED`: ready to be sent.
    Validated => Validated,
    /// `MALFORMED`: validation failed. Terminal.
    Malformed => Malformed,
    /// `UNABLE_TO_SEND`: submission failed; may be retried.
    UnableToSend => UnableToSend,
    /// `SENT_TO_PERMISSION_ADMINISTRATOR`: waiting for the customer's answer.
    Sent => SentToPermissionAdministrator,
    /// `PENDING_PERMISSION_ADMINISTRATOR_ACKNOWLEDGEMENT`: handed over, receipt not confirmed.
    PendingAcknowledgement => PendingPermissionAdministratorAcknowledgement,
    /// `ACCEPTED`: data may flow.
    Accepted => Accepted,
    /// `REJECTED`. Terminal.
    Rejected => Rejected,
    /// `INVALID`. Terminal.
    Invalid => Invalid,
    /// `TIMED_OUT`. Terminal.
    TimedOut => TimedOut,
    /// `FULFILLED`: terminal, may still require external termination.
    Fulfilled => Fulfilled,
    /// `UNFULFILLABLE`: terminal, may still require external termination.
    Unfulfillable => Unfulfillable,
    /// `TERMINATED`: terminal, may still require external termination.
    Terminated => Terminated,
    /// `REVOKED`. Terminal.
    Revoked => Revoked,
    /// `REQUIRES_EXTERNAL_TERMINATION`: the administrator must still be told.
    RequiresExternalTermination => RequiresExternalTermination,
    /// `FAILED_TO_TERMINATE`: telling the administrator failed; may be retried.
    FailedToTerminate => FailedToTerminate,
    /// `EXTERNALLY_TERMINATED`. Terminal.
    ExternallyTerminated => ExternallyTerminated,
}

impl fmt::Display for PermissionRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.request().permission_id(), self.status())
    }
}

impl Created {
    /// Commit the creation fact of a new request.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::AlreadyExists`] (wrapped) if `permission_id` is taken.
    pub async fn create(
        ctx: &StateContext,
        permission_id: PermissionId,
        new_request: NewPermissionRequest,
    ) -> Result<Self, StateError> {
        let event = PermissionEvent::new(permission_id, new_request.into_payload(), ctx.clock.now());
        let request = ctx.outbox.commit_expecting(None, event).await?;
        tracing::info!(permission_id = %request.permission_id(), "Permission request created");
        Ok(Self { request })
    }

    /// Resolve the requested window and run every validator.
    ///
    /// # Errors
    ///
    /// - [`StateError::Validation`] with every attribute error after committing
    ///   the malformed fact
    /// - [`StateError::Outbox`] if the commit fails
    pub async fn validate(self, ctx: &StateContext, validators: &ValidatorSet) -> Result<Validated, StateError> {
        let today = ctx.clock.today();
        let window = self.request.requested_window().resolve(today);
        let errors = validators.validate(&self.request, &window, &ValidationContext { today });

        if errors.is_empty() {
            let granularity = self.request.granularity();
            let request = ctx
                .commit(&self.request, EventPayload::Validated { window, granularity })
                .await?;
            tracing::info!(permission_id = %request.permission_id(), start = %window.start, end = %window.end, "Permission request validated");
            Ok(Validated { request })
        } else {
            ctx.commit(
                &self.request,
                EventPayload::Malformed {
                    errors: errors.clone(),
                },
            )
            .await?;
            tracing::info!(permission_id = %self.request.permission_id(), errors = errors.len(), "Permission request malformed");
            Err(StateError::Validation { errors })
        }
    }
}

/// Where a successful submission leads.
#[derive(Clone, Debug, PartialEq)]
pub enum SendOutcome {
    /// The administrator confirmed receipt.
    Sent(Sent),
    /// The administrator will confirm receipt later.
    Pending(PendingAcknowledgement),
}

impl SendOutcome {
    /// Status after the submission.
    #[must_use]
    pub fn status(&self) -> PermissionProcessStatus {
        match self {
            Self::Sent(_) => Sent::STATUS,
            Self::Pending(_) => PendingAcknowledgement::STATUS,
        }
    }
}

impl Validated {
    /// Submit the request to the permission administrator and commit the outcome.
    ///
    /// The call is awaited, never blocking a thread; the follow-up event is
    /// committed only once the result arrives.
    ///
    /// # Errors
    ///
    /// - [`StateError::Submission`] after committing `UNABLE_TO_SEND`;
    ///   `caller_fault` tells credential or content problems from transient ones
    /// - [`StateError::Outbox`] if the commit fails
    pub async fn send_to_permission_administrator(
        self,
        ctx: &StateContext,
        administrator: &dyn PermissionAdministrator,
    ) -> Result<SendOutcome, StateError> {
        match administrator.submit(&self.request).await {
            Ok(receipt) => {
                let awaiting = receipt.awaiting_acknowledgement;
                let request = ctx
                    .commit(
                        &self.request,
                        EventPayload::Sent {
                            external_reference: receipt.external_reference,
                            awaiting_acknowledgement: awaiting,
                        },
                    )
                    .await?;
                tracing::info!(permission_id = %request.permission_id(), status = %request.status(), "Permission request sent");
                Ok(if awaiting {
                    SendOutcome::Pending(PendingAcknowledgement { request })
                } else {
                    SendOutcome::Sent(Sent { request })
                })
            },
            Err(error) => {
                let caller_fault = error.kind.is_caller_fault();
                let cause = error.to_string();
                ctx.commit(
                    &self.request,
                    EventPayload::UnableToSend {
                        cause: cause.clone(),
                        caller_fault,
                    },
                )
                .await?;
                tracing::warn!(permission_id = %self.request.permission_id(), caller_fault, cause = %cause, "Could not send permission request");
                Err(StateError::Submission { caller_fault, cause })
            },
        }
    }
}

impl UnableToSend {
    /// Move back to `VALIDATED` so the request can be sent again.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn retry(self, ctx: &StateContext) -> Result<Validated, StateError> {
        let window = self
            .request
            .window()
            .unwrap_or_else(|| self.request.requested_window().resolve(ctx.clock.today()));
        let granularity = self.request.granularity();
        let request = ctx
            .commit(&self.request, EventPayload::Validated { window, granularity })
            .await?;
        Ok(Validated { request })
    }
}

impl PendingAcknowledgement {
    /// The administrator confirmed receipt.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn received_permission_administrator_response(self, ctx: &StateContext) -> Result<Sent, StateError> {
        let request = ctx
            .commit(
                &self.request,
                EventPayload::Sent {
                    external_reference: None,
                    awaiting_acknowledgement: false,
                },
            )
            .await?;
        Ok(Sent { request })
    }
}

impl Sent {
    /// The customer granted the permission.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails, e.g. because a
    /// timeout won the race.
    pub async fn accept(self, ctx: &StateContext, external_reference: Option<String>) -> Result<Accepted, StateError> {
        let request = ctx
            .commit(&self.request, EventPayload::Accepted { external_reference })
            .await?;
        tracing::info!(permission_id = %request.permission_id(), "Permission request accepted");
        Ok(Accepted { request })
    }

    /// The customer declined.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn reject(self, ctx: &StateContext, reason: Option<String>) -> Result<Rejected, StateError> {
        let request = ctx.commit(&self.request, EventPayload::Rejected { reason }).await?;
        Ok(Rejected { request })
    }

    /// The administrator considers the request invalid.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn invalid(self, ctx: &StateContext, reason: Option<String>) -> Result<Invalid, StateError> {
        let request = ctx.commit(&self.request, EventPayload::Invalid { reason }).await?;
        Ok(Invalid { request })
    }

    /// No answer arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails, e.g. because an
    /// acceptance won the race.
    pub async fn time_out(self, ctx: &StateContext) -> Result<TimedOut, StateError> {
        let request = ctx.commit(&self.request, EventPayload::TimedOut).await?;
        tracing::info!(permission_id = %request.permission_id(), "Permission request timed out");
        Ok(TimedOut { request })
    }
}

impl Accepted {
    /// The eligible party ends the permission.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn terminate(self, ctx: &StateContext, reason: Option<String>) -> Result<Terminated, StateError> {
        let request = ctx.commit(&self.request, EventPayload::Terminated { reason }).await?;
        tracing::info!(permission_id = %request.permission_id(), "Permission terminated");
        Ok(Terminated { request })
    }

    /// The customer revoked the permission at the administrator.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn revoke(self, ctx: &StateContext) -> Result<Revoked, StateError> {
        let request = ctx.commit(&self.request, EventPayload::Revoked).await?;
        tracing::info!(permission_id = %request.permission_id(), "Permission revoked");
        Ok(Revoked { request })
    }

    /// Every requested day was delivered.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn fulfill(self, ctx: &StateContext) -> Result<Fulfilled, StateError> {
        let request = ctx.commit(&self.request, EventPayload::Fulfilled).await?;
        tracing::info!(permission_id = %request.permission_id(), "Permission fulfilled");
        Ok(Fulfilled { request })
    }

    /// The data can never be delivered.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn unfulfillable(self, ctx: &StateContext, reason: Option<String>) -> Result<Unfulfillable, StateError> {
        let request = ctx
            .commit(&self.request, EventPayload::Unfulfillable { reason })
            .await?;
        Ok(Unfulfillable { request })
    }

    /// Record that metering data for `start..=end` arrived. The status stays `ACCEPTED`.
    ///
    /// # Errors
    ///
    /// - [`StateError::Validation`] if `end` lies before `start`; nothing is committed
    /// - [`StateError::Outbox`] if the commit fails
    pub async fn record_data_received(
        self,
        ctx: &StateContext,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Self, StateError> {
        if end < start {
            return Err(StateError::Validation {
                errors: vec![AttributeError::new(END, "must not be before start")],
            });
        }
        let request = ctx
            .commit(&self.request, EventPayload::DataReceived { start, end })
            .await?;
        tracing::debug!(permission_id = %request.permission_id(), %start, %end, "Metering data received");
        Ok(Self { request })
    }
}

async fn require_external_termination(
    ctx: &StateContext,
    request: &PermissionRequest,
) -> Result<RequiresExternalTermination, StateError> {
    let request = ctx
        .commit(request, EventPayload::RequiresExternalTermination)
        .await?;
    Ok(RequiresExternalTermination { request })
}

impl Fulfilled {
    /// The administrator must be told that the permission ended.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn require_external_termination(
        self,
        ctx: &StateContext,
    ) -> Result<RequiresExternalTermination, StateError> {
        require_external_termination(ctx, &self.request).await
    }
}

impl Unfulfillable {
    /// The administrator must be told that the permission ended.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn require_external_termination(
        self,
        ctx: &StateContext,
    ) -> Result<RequiresExternalTermination, StateError> {
        require_external_termination(ctx, &self.request).await
    }
}

impl Terminated {
    /// The administrator must be told that the permission ended.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn require_external_termination(
        self,
        ctx: &StateContext,
    ) -> Result<RequiresExternalTermination, StateError> {
        require_external_termination(ctx, &self.request).await
    }
}

/// Where a termination call at the administrator leads.
#[derive(Clone, Debug, PartialEq)]
pub enum TerminationResult {
    /// The administrator confirmed synchronously.
    Terminated(ExternallyTerminated),
    /// The administrator will acknowledge later.
    Awaiting(RequiresExternalTermination),
    /// The call failed; a retry may follow.
    Failed(FailedToTerminate),
}

impl RequiresExternalTermination {
    /// Ask the administrator to terminate and commit the outcome.
    ///
    /// Failures of the call become `FAILED_TO_TERMINATE` rather than errors.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn terminate_at_permission_administrator(
        self,
        ctx: &StateContext,
        administrator: &dyn PermissionAdministrator,
    ) -> Result<TerminationResult, StateError> {
        match administrator.terminate(&self.request).await {
            Ok(TerminationOutcome::Confirmed) => self.externally_terminated(ctx).await.map(TerminationResult::Terminated),
            Ok(TerminationOutcome::AwaitingAcknowledgement) => {
                tracing::debug!(permission_id = %self.request.permission_id(), "Waiting for termination acknowledgement");
                Ok(TerminationResult::Awaiting(self))
            },
            Err(error) => {
                tracing::warn!(permission_id = %self.request.permission_id(), error = %error, "External termination failed");
                self.failed_to_terminate(ctx, error.to_string())
                    .await
                    .map(TerminationResult::Failed)
            },
        }
    }

    /// The administrator confirmed the termination.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn externally_terminated(self, ctx: &StateContext) -> Result<ExternallyTerminated, StateError> {
        let request = ctx
            .commit(&self.request, EventPayload::ExternallyTerminated)
            .await?;
        tracing::info!(permission_id = %request.permission_id(), "Permission externally terminated");
        Ok(ExternallyTerminated { request })
    }

    /// Terminating at the administrator failed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn failed_to_terminate(self, ctx: &StateContext, cause: String) -> Result<FailedToTerminate, StateError> {
        let request = ctx
            .commit(&self.request, EventPayload::FailedToTerminate { cause })
            .await?;
        Ok(FailedToTerminate { request })
    }
}

impl FailedToTerminate {
    /// Try the external termination again.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Outbox`] if the commit fails.
    pub async fn retry(self, ctx: &StateContext) -> Result<RequiresExternalTermination, StateError> {
        require_external_termination(ctx, &self.request).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::environment::{BoxFuture, Receipt, SubmissionError, SubmissionErrorKind};
    use crate::request::{DataSourceInformation, RequestedWindow};
    use crate::transition::TransitionTable;
    use crate::validation::{StartBeforeEndValidator, Validator};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    struct Fixed(DateTime<Utc>);

    impl Clock for Fixed {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[derive(Default)]
    struct FoldingOutbox {
        table: TransitionTable,
        requests: Mutex<HashMap<PermissionId, PermissionRequest>>,
    }

    impl Outbox for FoldingOutbox {
        fn commit_expecting(
            &self,
            expected: Option<PermissionProcessStatus>,
            event: PermissionEvent,
        ) -> BoxFuture<'_, Result<PermissionRequest, OutboxError>> {
            Box::pin(async move {
                let mut requests = self.requests.lock().unwrap();
                let id = event.permission_id().clone();
                let Some(current) = requests.get_mut(&id) else {
                    let created = PermissionRequest::from_creation(&event)
                        .ok_or_else(|| OutboxError::UnknownPermission(id.clone()))?;
                    requests.insert(id, created.clone());
                    return Ok(created);
                };
                if let Some(expected) = expected.filter(|e| *e != current.status()) {
                    return Err(OutboxError::StatusConflict {
                        permission_id: id,
                        expected,
                        actual: current.status(),
                    });
                }
                if !matches!(event.step(), crate::transition::Step::Assertion(s) if s == current.status()) {
                    self.table
                        .check(current.status(), event.status())
                        .map_err(|source| OutboxError::IllegalTransition {
                            permission_id: id.clone(),
                            source,
                        })?;
                }
                current.apply(&event);
                Ok(current.clone())
            })
        }
    }

    struct ScriptedAdministrator(Result<Receipt, SubmissionError>);

    impl PermissionAdministrator for ScriptedAdministrator {
        fn submit<'a>(&'a self, _request: &'a PermissionRequest) -> BoxFuture<'a, Result<Receipt, SubmissionError>> {
            let result = self.0.clone();
            Box::pin(async move { result })
        }

        fn terminate<'a>(
            &'a self,
            _request: &'a PermissionRequest,
        ) -> BoxFuture<'a, Result<TerminationOutcome, SubmissionError>> {
            Box::pin(async { Ok(TerminationOutcome::Confirmed) })
        }
    }

    struct TooOld;

    impl Validator for TooOld {
        fn name(&self) -> &'static str {
            "too-old"
        }

        fn validate(
            &self,
            _request: &PermissionRequest,
            _window: &crate::request::ValidityWindow,
            _context: &ValidationContext,
        ) -> Vec<AttributeError> {
            vec![AttributeError::new("start", "too old")]
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn context() -> StateContext {
        StateContext::new(
            Arc::new(FoldingOutbox::default()),
            Arc::new(Fixed(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())),
        )
    }

    fn new_request() -> NewPermissionRequest {
        NewPermissionRequest {
            connection_id: "cid".into(),
            data_need_id: "dnid".into(),
            data_source: DataSourceInformation {
                country_code: "AT".into(),
                region_connector_id: "at-eda".into(),
                permission_administrator_id: "pa".into(),
                meter_data_administrator_id: "mda".into(),
            },
            requested_window: RequestedWindow::Absolute {
                start: date(2025, 1, 1),
                end: date(2025, 1, 31),
            },
            metering_point: Some("AT0001".into()),
            granularity: None,
            extensions: BTreeMap::new(),
        }
    }

    async fn validated(ctx: &StateContext) -> Validated {
        Created::create(ctx, PermissionId::new("p1"), new_request())
            .await
            .unwrap()
            .validate(ctx, &ValidatorSet::new().with(StartBeforeEndValidator))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn validation_failure_lands_in_malformed() {
        let ctx = context();
        let created = Created::create(&ctx, PermissionId::new("p1"), new_request()).await.unwrap();

        let error = created
            .validate(&ctx, &ValidatorSet::new().with(TooOld))
            .await
            .unwrap_err();

        match error {
            StateError::Validation { errors } => {
                assert_eq!(errors, vec![AttributeError::new("start", "too old")]);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn validation_resolves_window() {
        let ctx = context();
        let validated = validated(&ctx).await;
        assert_eq!(validated.request().start(), Some(date(2025, 1, 1)));
        assert_eq!(validated.request().status(), PermissionProcessStatus::Validated);
    }

    #[tokio::test]
    async fn unauthorized_submission_is_callers_fault() {
        let ctx = context();
        let administrator = ScriptedAdministrator(Err(SubmissionError::new(
            SubmissionErrorKind::Unauthorized,
            "bad token",
        )));

        let error = validated(&ctx)
            .await
            .send_to_permission_administrator(&ctx, &administrator)
            .await
            .unwrap_err();

        assert!(matches!(error, StateError::Submission { caller_fault: true, .. }));
    }

    #[tokio::test]
    async fn pending_receipt_needs_acknowledgement() {
        let ctx = context();
        let administrator = ScriptedAdministrator(Ok(Receipt {
            external_reference: Some("conv-1".into()),
            awaiting_acknowledgement: true,
        }));

        let outcome = validated(&ctx)
            .await
            .send_to_permission_administrator(&ctx, &administrator)
            .await
            .unwrap();
        let SendOutcome::Pending(pending) = outcome else {
            panic!("expected pending acknowledgement");
        };
        let sent = pending
            .received_permission_administrator_response(&ctx)
            .await
            .unwrap();

        assert_eq!(sent.request().external_reference(), Some("conv-1"));
        assert_eq!(sent.request().status(), Sent::STATUS);
    }

    #[tokio::test]
    async fn stale_capability_loses_against_newer_status() {
        let ctx = context();
        let administrator = ScriptedAdministrator(Ok(Receipt::default()));
        let SendOutcome::Sent(sent) = validated(&ctx)
            .await
            .send_to_permission_administrator(&ctx, &administrator)
            .await
            .unwrap()
        else {
            panic!("expected sent");
        };

        let duplicate = sent.clone();
        sent.accept(&ctx, None).await.unwrap();
        let error = duplicate.time_out(&ctx).await.unwrap_err();

        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn inverted_data_window_is_rejected_without_commit() {
        let ctx = context();
        let administrator = ScriptedAdministrator(Ok(Receipt::default()));
        let SendOutcome::Sent(sent) = validated(&ctx)
            .await
            .send_to_permission_administrator(&ctx, &administrator)
            .await
            .unwrap()
        else {
            panic!("expected sent");
        };
        let accepted = sent.accept(&ctx, None).await.unwrap();
        let version = accepted.request().version();

        let error = accepted
            .clone()
            .record_data_received(&ctx, date(2025, 1, 10), date(2025, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(error, StateError::Validation { .. }));

        let accepted = accepted
            .record_data_received(&ctx, date(2025, 1, 1), date(2025, 1, 10))
            .await
            .unwrap();
        assert_eq!(accepted.request().version(), version.next());
        assert_eq!(accepted.request().latest_meter_reading_end(), Some(date(2025, 1, 10)));
    }

    #[tokio::test]
    async fn states_wrap_matching_variant() {
        let ctx = context();
        let validated = validated(&ctx).await;
        let state = PermissionRequestState::from_request(validated.into_request());
        assert!(matches!(state, PermissionRequestState::Validated(_)));
        assert_eq!(state.status(), PermissionProcessStatus::Validated);
    }
}
