//! Composition root of the lifecycle engine.
//!
//! [`EngineBuilder`] wires the event store, repository, outbox, bus and every
//! saga handler together. All subscriptions happen in
//! [`EngineBuilder::build`], so the full saga graph is visible in one place.
//!
//! # Example
//!
//! ```no_run
//! use consent_core::environment::SystemClock;
//! use consent_runtime::{EngineBuilder, EngineConfig};
//! use consent_testing::helpers::new_request;
//! use consent_testing::{ScriptedAdministrator, ScriptedMeterDataSource};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = EngineBuilder::new()
//!     .with_config(EngineConfig::from_env()?)
//!     .with_administrator(Arc::new(ScriptedAdministrator::new()))
//!     .with_meter_data_source(Arc::new(ScriptedMeterDataSource::new()))
//!     .build()?;
//! engine.rehydrate().await?;
//!
//! let (shutdown, signal) = watch::channel(false);
//! if let Some(poller) = engine.poller() {
//!     let signal = signal.clone();
//!     tokio::spawn(async move { poller.run(Arc::new(SystemClock), signal).await });
//! }
//! let sweeper = engine.sweeper();
//! tokio::spawn(async move { sweeper.run(Arc::new(SystemClock), signal).await });
//!
//! let created = engine.create(new_request()).await?;
//! engine.validate(created).await?;
//! engine.settle().await;
//! shutdown.send(true)?;
//! # Ok(())
//! # }
//! ```

use crate::bus::InProcessEventBus;
use crate::config::{ConfigError, EngineConfig};
use crate::memory::{InMemoryEventStore, InMemoryPermissionRequestRepository};
use crate::metrics::register_metrics;
use crate::outbox::TransactionalOutbox;
use crate::poller::MeterDataPoller;
use crate::sagas::{
    AcceptanceHandler, DataReceivedHandler, ExternalTerminationHandler, RequireExternalTerminationHandler,
    SagaContext, SendHandler, SendRetryHandler, TerminationRetryHandler,
};
use crate::sweeper::StaleRequestSweeper;
use crate::tracking::InFlight;
use consent_core::environment::{Clock, MeterDataSource, PermissionAdministrator, SystemClock};
use consent_core::error::{ErrorClass, StateError};
use consent_core::event::{EventKind, PermissionEvent};
use consent_core::event_bus::{EventBus, EventHandler};
use consent_core::event_store::{EventStore, EventStoreError, load_permission_events};
use consent_core::repository::PermissionRequestRepository;
use consent_core::request::{NewPermissionRequest, PermissionRequest};
use consent_core::state::{Created, PermissionRequestState, StateContext, Validated};
use consent_core::status::PermissionProcessStatus;
use consent_core::stream::PermissionId;
use consent_core::transition::TransitionTable;
use consent_core::validation::ValidatorSet;
use std::sync::Arc;
use thiserror::Error;

/// Retention window of the default validator set.
pub const DEFAULT_RETENTION_MONTHS: u32 = 36;

/// Commits competing with the sagas before an acknowledgement gives up.
const ACKNOWLEDGE_ATTEMPTS: u32 = 4;

/// Errors surfaced by the engine facade.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No permission request with this id exists.
    #[error("Permission request {0} not found")]
    NotFound(PermissionId),

    /// The request is in a status the operation does not apply to.
    #[error("Permission request {permission_id} is {status}, operation not applicable")]
    UnexpectedStatus {
        /// The addressed request.
        permission_id: PermissionId,
        /// Its current status.
        status: PermissionProcessStatus,
    },

    /// A state operation failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// The event store or repository failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A required collaborator was not supplied to the builder.
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
}

impl EngineError {
    /// Boundary classification of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) | Self::UnexpectedStatus { .. } => ErrorClass::Client,
            Self::State(error) => error.class(),
            Self::Store(_) | Self::Config(_) | Self::MissingCollaborator(_) => ErrorClass::Server,
        }
    }

    /// Whether this error only means that another writer got there first.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::State(error) if error.is_conflict())
    }
}

/// A stream that failed the recovery check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorruptedStream {
    /// The affected request.
    pub permission_id: PermissionId,
    /// Why the stream was rejected.
    pub reason: String,
}

/// Outcome of [`PermissionEngine::rehydrate`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Streams replayed into the repository.
    pub restored: usize,
    /// Unfinished requests whose last event was handed to the sagas again.
    pub republished: usize,
    /// Streams left out of the repository.
    pub corrupted: Vec<CorruptedStream>,
}

impl RecoveryReport {
    /// Whether every stream was restored.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty()
    }
}

/// Builder for [`PermissionEngine`].
pub struct EngineBuilder {
    store: Arc<dyn EventStore>,
    repository: Arc<dyn PermissionRequestRepository>,
    clock: Arc<dyn Clock>,
    administrator: Option<Arc<dyn PermissionAdministrator>>,
    meter_data: Option<Arc<dyn MeterDataSource>>,
    validators: ValidatorSet,
    config: EngineConfig,
    table: TransitionTable,
}

impl EngineBuilder {
    /// Start from in-memory storage, the system clock, the standard validators,
    /// default configuration and the canonical transition table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryEventStore::new()),
            repository: Arc::new(InMemoryPermissionRequestRepository::new()),
            clock: Arc::new(SystemClock),
            administrator: None,
            meter_data: None,
            validators: ValidatorSet::standard(DEFAULT_RETENTION_MONTHS),
            config: EngineConfig::default(),
            table: TransitionTable::canonical(),
        }
    }

    /// Use another event store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = store;
        self
    }

    /// Use another projection repository.
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn PermissionRequestRepository>) -> Self {
        self.repository = repository;
        self
    }

    /// Use another clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The permission administrator requests are sent to. Required.
    #[must_use]
    pub fn with_administrator(mut self, administrator: Arc<dyn PermissionAdministrator>) -> Self {
        self.administrator = Some(administrator);
        self
    }

    /// Source of metering data. Without one, accepted requests wait for
    /// data-received facts recorded by the host.
    #[must_use]
    pub fn with_meter_data_source(mut self, source: Arc<dyn MeterDataSource>) -> Self {
        self.meter_data = Some(source);
        self
    }

    /// Replace the validator set.
    #[must_use]
    pub fn with_validators(mut self, validators: ValidatorSet) -> Self {
        self.validators = validators;
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the transition table, e.g. with one omitting unused statuses.
    #[must_use]
    pub fn with_table(mut self, table: TransitionTable) -> Self {
        self.table = table;
        self
    }

    /// Wire everything together and subscribe the saga handlers.
    ///
    /// Must be called from within a Tokio runtime: every subscription spawns
    /// its worker tasks.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Config`] if the configuration is invalid
    /// - [`EngineError::MissingCollaborator`] without a permission administrator
    pub fn build(self) -> Result<PermissionEngine, EngineError> {
        self.config.validate()?;
        let administrator = self
            .administrator
            .ok_or(EngineError::MissingCollaborator("permission administrator"))?;
        register_metrics();

        let in_flight = InFlight::new();
        let bus = Arc::new(InProcessEventBus::with_tracker(self.config.bus_shards, in_flight.clone()));
        let table = Arc::new(self.table);
        let outbox = Arc::new(TransactionalOutbox::new(
            Arc::clone(&self.store),
            Arc::clone(&self.repository),
            bus.clone(),
            Arc::clone(&table),
        ));
        let state = StateContext::new(outbox.clone(), Arc::clone(&self.clock));
        let saga = SagaContext::new(state.clone(), Arc::clone(&self.repository), in_flight);

        bus.subscribe(
            EventKind::Validated.into(),
            Arc::new(SendHandler::new(saga.clone(), Arc::clone(&administrator))),
        );
        bus.subscribe(
            EventKind::UnableToSend.into(),
            Arc::new(SendRetryHandler::new(saga.clone(), self.config.send_retry)),
        );
        let poller = self.meter_data.map(|source| {
            Arc::new(MeterDataPoller::new(
                state.clone(),
                Arc::clone(&self.repository),
                source,
                self.config.poll_retry,
                self.config.poll_interval(),
            ))
        });
        if let Some(poller) = &poller {
            bus.subscribe(
                EventKind::Accepted.into(),
                Arc::new(AcceptanceHandler::new(saga.clone(), Arc::clone(poller))),
            );
        }
        bus.subscribe(
            EventKind::DataReceived.into(),
            Arc::new(DataReceivedHandler::new(saga.clone())),
        );
        let require_termination: Arc<dyn EventHandler> =
            Arc::new(RequireExternalTerminationHandler::new(saga.clone()));
        if self.config.terminate_externally {
            bus.subscribe(EventKind::Terminated.into(), Arc::clone(&require_termination));
        }
        if self.config.terminate_on_fulfillment {
            bus.subscribe(EventKind::Fulfilled.into(), require_termination);
        }
        bus.subscribe(
            EventKind::RequiresExternalTermination.into(),
            Arc::new(ExternalTerminationHandler::new(saga.clone(), administrator)),
        );
        bus.subscribe(
            EventKind::FailedToTerminate.into(),
            Arc::new(TerminationRetryHandler::new(saga, self.config.termination_retry)),
        );

        tracing::info!(
            subscriptions = bus.subscription_count(),
            shards = self.config.bus_shards,
            "Permission engine started"
        );

        Ok(PermissionEngine {
            state,
            store: self.store,
            repository: self.repository,
            outbox,
            bus,
            poller,
            validators: self.validators,
            table,
            config: self.config,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Facade over the running lifecycle engine.
pub struct PermissionEngine {
    state: StateContext,
    store: Arc<dyn EventStore>,
    repository: Arc<dyn PermissionRequestRepository>,
    outbox: Arc<TransactionalOutbox>,
    bus: Arc<InProcessEventBus>,
    poller: Option<Arc<MeterDataPoller>>,
    validators: ValidatorSet,
    table: Arc<TransitionTable>,
    config: EngineConfig,
}

impl PermissionEngine {
    /// Create a request under a freshly generated id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] if the creation cannot be committed.
    pub async fn create(&self, new_request: NewPermissionRequest) -> Result<Created, EngineError> {
        self.create_with_id(PermissionId::generate(), new_request).await
    }

    /// Create a request under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] if the id is taken or the commit fails.
    pub async fn create_with_id(
        &self,
        permission_id: PermissionId,
        new_request: NewPermissionRequest,
    ) -> Result<Created, EngineError> {
        Ok(Created::create(&self.state, permission_id, new_request).await?)
    }

    /// Validate a freshly created request with the engine's validators.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] carrying the validation errors after the
    /// request moved to `MALFORMED`.
    pub async fn validate(&self, created: Created) -> Result<Validated, EngineError> {
        Ok(created.validate(&self.state, &self.validators).await?)
    }

    /// Current state of a request with the capabilities of its status.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] for an unknown id
    /// - [`EngineError::Store`] if the repository fails
    pub async fn state(&self, permission_id: &PermissionId) -> Result<PermissionRequestState, EngineError> {
        self.request(permission_id)
            .await
            .map(PermissionRequestState::from_request)
    }

    /// Read-only projection of a request.
    ///
    /// # Errors
    ///
    /// Same as [`PermissionEngine::state`].
    pub async fn request(&self, permission_id: &PermissionId) -> Result<PermissionRequest, EngineError> {
        self.repository
            .find_by_permission_id(permission_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(permission_id.clone()))
    }

    /// Every committed event of a request in commit order.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] if the stream is empty
    /// - [`EngineError::Store`] if the store fails or an event cannot be decoded
    pub async fn events(&self, permission_id: &PermissionId) -> Result<Vec<PermissionEvent>, EngineError> {
        let events = load_permission_events(self.store.as_ref(), permission_id).await?;
        if events.is_empty() {
            return Err(EngineError::NotFound(permission_id.clone()));
        }
        Ok(events)
    }

    /// Record that the administrator confirmed the termination of a permission.
    ///
    /// Returns `false` if the request was already externally terminated, so a
    /// duplicate acknowledgement is a no-op. Requests that ended without
    /// passing through `REQUIRES_EXTERNAL_TERMINATION` yet are moved there first.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] for an unknown id
    /// - [`EngineError::UnexpectedStatus`] if the permission has not ended
    /// - [`EngineError::State`] if a commit fails
    pub async fn acknowledge_external_termination(&self, permission_id: &PermissionId) -> Result<bool, EngineError> {
        let mut attempt = 1;
        loop {
            match self.acknowledge_once(permission_id).await {
                // The termination sagas advance the same request; start over from its new status.
                Err(error) if error.is_conflict() && attempt < ACKNOWLEDGE_ATTEMPTS => {
                    tracing::debug!(
                        permission_id = %permission_id,
                        attempt,
                        "Termination acknowledgement raced a saga, retrying"
                    );
                    attempt += 1;
                },
                Err(error) if error.is_conflict() => {
                    return match self.state(permission_id).await? {
                        PermissionRequestState::ExternallyTerminated(_) => Ok(false),
                        _ => Err(error),
                    };
                },
                other => return other,
            }
        }
    }

    async fn acknowledge_once(&self, permission_id: &PermissionId) -> Result<bool, EngineError> {
        let ctx = &self.state;
        let pending = match self.state(permission_id).await? {
            PermissionRequestState::ExternallyTerminated(_) => {
                tracing::debug!(permission_id = %permission_id, "Duplicate termination acknowledgement ignored");
                return Ok(false);
            },
            PermissionRequestState::RequiresExternalTermination(pending) => pending,
            PermissionRequestState::FailedToTerminate(failed) => failed.retry(ctx).await?,
            PermissionRequestState::Terminated(terminated) => terminated.require_external_termination(ctx).await?,
            PermissionRequestState::Fulfilled(fulfilled) => fulfilled.require_external_termination(ctx).await?,
            PermissionRequestState::Unfulfillable(unfulfillable) => {
                unfulfillable.require_external_termination(ctx).await?
            },
            other => {
                return Err(EngineError::UnexpectedStatus {
                    permission_id: permission_id.clone(),
                    status: other.status(),
                });
            },
        };
        pending.externally_terminated(ctx).await?;
        Ok(true)
    }

    /// Rebuild the repository from the event store and resume unfinished work.
    ///
    /// Every stream is decoded, checked against the transition table and
    /// folded. Streams failing the check are reported, logged at `error`, and
    /// left out of the repository. The last event of every restored request
    /// that can still move is published again, so a follow-up lost to a crash
    /// or a closed bus is picked up by the sagas. Handlers ignore deliveries
    /// that no longer match the request.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the store cannot list its streams or
    /// the repository cannot be written.
    pub async fn rehydrate(&self) -> Result<RecoveryReport, EngineError> {
        self.repository.clear().await?;
        let mut report = RecoveryReport::default();
        let mut unfinished = Vec::new();

        for permission_id in self.store.stream_ids().await? {
            match self.restore(&permission_id).await {
                Ok((request, last)) => {
                    let status = request.status();
                    self.repository.save(request).await?;
                    report.restored += 1;
                    if !self.table.successors(status).is_empty() {
                        unfinished.push(last);
                    }
                },
                Err(reason) => {
                    tracing::error!(permission_id = %permission_id, reason = %reason, "Corrupted event stream");
                    report.corrupted.push(CorruptedStream { permission_id, reason });
                },
            }
        }

        for event in &unfinished {
            match self.bus.publish(event) {
                Ok(()) => report.republished += 1,
                Err(error) => {
                    tracing::warn!(
                        permission_id = %event.permission_id(),
                        error = %error,
                        "Could not resume unfinished permission request"
                    );
                },
            }
        }

        tracing::info!(
            restored = report.restored,
            republished = report.republished,
            corrupted = report.corrupted.len(),
            "Permission requests rehydrated"
        );
        Ok(report)
    }

    async fn restore(&self, permission_id: &PermissionId) -> Result<(PermissionRequest, PermissionEvent), String> {
        let mut events = load_permission_events(self.store.as_ref(), permission_id)
            .await
            .map_err(|e| e.to_string())?;
        self.table
            .check_walk(events.iter().map(PermissionEvent::step))
            .map_err(|e| e.to_string())?;
        let request = PermissionRequest::from_events(&events).map_err(|e| e.to_string())?;
        let last = events.pop().ok_or_else(|| format!("event stream of {permission_id} is empty"))?;
        Ok((request, last))
    }

    /// A sweeper timing out stale requests with the configured threshold.
    #[must_use]
    pub fn sweeper(&self) -> StaleRequestSweeper {
        StaleRequestSweeper::new(
            self.state.clone(),
            Arc::clone(&self.repository),
            self.config.stale_after(),
            self.config.sweep_interval(),
        )
    }

    /// The metering data poller, if a meter data source was supplied.
    ///
    /// Hosts drive it with [`MeterDataPoller::run`]; the first fetch after an
    /// acceptance happens without it.
    #[must_use]
    pub fn poller(&self) -> Option<Arc<MeterDataPoller>> {
        self.poller.clone()
    }

    /// Wait until every published event was handled and no retry is scheduled.
    pub async fn settle(&self) {
        self.bus.settle().await;
    }

    /// Stop accepting events; running handlers finish.
    pub fn shutdown(&self) {
        self.bus.shutdown();
    }

    /// Context for driving state operations directly.
    #[must_use]
    pub const fn context(&self) -> &StateContext {
        &self.state
    }

    /// The engine's validators.
    #[must_use]
    pub const fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// The engine's outbox.
    #[must_use]
    pub const fn outbox(&self) -> &Arc<TransactionalOutbox> {
        &self.outbox
    }

    /// The engine's event bus.
    #[must_use]
    pub const fn bus(&self) -> &Arc<InProcessEventBus> {
        &self.bus
    }

    /// The transition table commits are checked against.
    #[must_use]
    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionEngine")
            .field("bus", &self.bus)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_a_client_error() {
        assert_eq!(EngineError::NotFound(PermissionId::new("x")).class(), ErrorClass::Client);
        assert_eq!(
            EngineError::MissingCollaborator("permission administrator").class(),
            ErrorClass::Server
        );
    }

    #[test]
    fn builder_requires_an_administrator() {
        let result = EngineBuilder::new().build();
        assert!(matches!(result, Err(EngineError::MissingCollaborator(_))));
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let config = EngineConfig {
            bus_shards: 0,
            ..EngineConfig::default()
        };
        let result = EngineBuilder::new().with_config(config).build();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
