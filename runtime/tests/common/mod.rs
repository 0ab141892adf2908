//! Shared harness for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use consent_core::environment::Clock;
use consent_core::event_bus::EventBus;
use consent_core::state::{PermissionRequestState, Sent, StateContext};
use consent_core::stream::PermissionId;
use consent_core::transition::TransitionTable;
use consent_runtime::{
    EngineBuilder, EngineConfig, InMemoryEventStore, InMemoryPermissionRequestRepository, InProcessEventBus,
    PermissionEngine, RetryPolicy, TransactionalOutbox,
};
use consent_testing::helpers::new_request;
use consent_testing::{FixedClock, ScriptedAdministrator, ScriptedMeterDataSource, init_tracing, test_clock};
use std::sync::Arc;
use std::time::Duration;

/// Retries after a millisecond or two, so tests settle fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(max_attempts)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        bus_shards: 4,
        send_retry: fast_retry(3),
        termination_retry: fast_retry(3),
        ..EngineConfig::default()
    }
}

/// A running engine with scripted collaborators.
pub struct Harness {
    pub engine: PermissionEngine,
    pub administrator: Arc<ScriptedAdministrator>,
    pub meter_data: Option<Arc<ScriptedMeterDataSource>>,
    pub clock: FixedClock,
    pub store: InMemoryEventStore,
}

pub fn harness() -> Harness {
    harness_with(fast_config(), ScriptedAdministrator::new(), None)
}

pub fn harness_with(
    config: EngineConfig,
    administrator: ScriptedAdministrator,
    meter_data: Option<ScriptedMeterDataSource>,
) -> Harness {
    init_tracing();
    let clock = test_clock();
    let store = InMemoryEventStore::new();
    let administrator = Arc::new(administrator);
    let meter_data = meter_data.map(Arc::new);

    let mut builder = EngineBuilder::new()
        .with_store(Arc::new(store.clone()))
        .with_clock(Arc::new(clock.clone()))
        .with_administrator(administrator.clone())
        .with_config(config);
    if let Some(source) = &meter_data {
        builder = builder.with_meter_data_source(source.clone());
    }

    Harness {
        engine: builder.build().expect("engine builds"),
        administrator,
        meter_data,
        clock,
        store,
    }
}

impl Harness {
    /// Create and validate a request, then let the sagas send it.
    pub async fn sent(&self) -> PermissionId {
        let created = self.engine.create(new_request()).await.unwrap();
        let permission_id = created.request().permission_id().clone();
        self.engine.validate(created).await.unwrap();
        self.engine.settle().await;
        permission_id
    }

    /// Drive a request to `ACCEPTED`.
    pub async fn accepted(&self) -> PermissionId {
        let permission_id = self.sent().await;
        let sent = self.sent_state(&permission_id).await;
        sent.accept(self.engine.context(), Some("consent-1".into()))
            .await
            .unwrap();
        self.engine.settle().await;
        permission_id
    }

    pub async fn sent_state(&self, permission_id: &PermissionId) -> Sent {
        match self.engine.state(permission_id).await.unwrap() {
            PermissionRequestState::Sent(sent) => sent,
            other => panic!("expected SENT_TO_PERMISSION_ADMINISTRATOR, got {other}"),
        }
    }

    pub async fn statuses(&self, permission_id: &PermissionId) -> Vec<consent_core::PermissionProcessStatus> {
        self.engine
            .events(permission_id)
            .await
            .unwrap()
            .iter()
            .map(consent_core::PermissionEvent::status)
            .collect()
    }
}

/// Lifecycle machinery without any saga subscribed.
pub struct Bare {
    pub ctx: StateContext,
    pub store: InMemoryEventStore,
    pub repository: InMemoryPermissionRequestRepository,
    pub outbox: Arc<TransactionalOutbox>,
    pub bus: Arc<InProcessEventBus>,
    pub clock: FixedClock,
}

pub fn bare() -> Bare {
    init_tracing();
    let clock = test_clock();
    let store = InMemoryEventStore::new();
    let repository = InMemoryPermissionRequestRepository::new();
    let bus = Arc::new(InProcessEventBus::new(2));
    let outbox = Arc::new(TransactionalOutbox::new(
        Arc::new(store.clone()),
        Arc::new(repository.clone()),
        bus.clone() as Arc<dyn EventBus>,
        Arc::new(TransitionTable::canonical()),
    ));
    let ctx = StateContext::new(outbox.clone(), Arc::new(clock.clone()) as Arc<dyn Clock>);
    Bare {
        ctx,
        store,
        repository,
        outbox,
        bus,
        clock,
    }
}
