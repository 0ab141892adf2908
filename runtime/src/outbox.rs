//! Transactional outbox: check, append, project, then publish.
//!
//! Commits for one permission id run inside a per-id critical section, so the
//! store, the repository and the bus all observe them in issue order. Commits
//! for different ids never wait on each other.
//!
//! ```text
//! commit(event)
//!   ├─ lock(permission_id)
//!   ├─ load current projection (repository, else replay)
//!   ├─ compare-and-swap on expected status
//!   ├─ transition table check          ── IllegalTransition → error! + metric
//!   ├─ append to event store (expected version)
//!   │    └─ version conflict           ── replay, check again, append once more
//!   ├─ save projection                 ── failure → replay on the next commit
//!   ├─ publish on event bus
//!   └─ unlock
//! ```

use crate::metrics::OutboxMetrics;
use consent_core::environment::BoxFuture;
use consent_core::error::OutboxError;
use consent_core::event::{Event, EventKind, PermissionEvent};
use consent_core::event_bus::EventBus;
use consent_core::event_store::{EventStore, EventStoreError, load_permission_events};
use consent_core::outbox::Outbox;
use consent_core::repository::PermissionRequestRepository;
use consent_core::request::PermissionRequest;
use consent_core::status::PermissionProcessStatus;
use consent_core::stream::PermissionId;
use consent_core::transition::{IllegalTransition, Step, TransitionTable};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// The engine's only writer of events and projections.
pub struct TransactionalOutbox {
    store: Arc<dyn EventStore>,
    repository: Arc<dyn PermissionRequestRepository>,
    bus: Arc<dyn EventBus>,
    table: Arc<TransitionTable>,
    locks: Mutex<HashMap<PermissionId, Arc<Mutex<()>>>>,
    // Projections that may lag behind the store after a failed save.
    lagging: Mutex<HashSet<PermissionId>>,
}

impl TransactionalOutbox {
    /// Create a new outbox.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        repository: Arc<dyn PermissionRequestRepository>,
        bus: Arc<dyn EventBus>,
        table: Arc<TransitionTable>,
    ) -> Self {
        Self {
            store,
            repository,
            bus,
            table,
            locks: Mutex::new(HashMap::new()),
            lagging: Mutex::new(HashSet::new()),
        }
    }

    /// The transition table commits are checked against.
    #[must_use]
    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    async fn lock_for(&self, permission_id: &PermissionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(permission_id.clone()).or_default())
    }

    async fn release(&self, permission_id: &PermissionId, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // Only the map and this caller hold the lock: nobody is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(permission_id);
        }
    }

    async fn current(&self, permission_id: &PermissionId) -> Result<Option<PermissionRequest>, EventStoreError> {
        if self.lagging.lock().await.contains(permission_id) {
            return self.repair(permission_id).await;
        }
        if let Some(request) = self.repository.find_by_permission_id(permission_id).await? {
            return Ok(Some(request));
        }
        self.replay(permission_id).await
    }

    async fn replay(&self, permission_id: &PermissionId) -> Result<Option<PermissionRequest>, EventStoreError> {
        let events = load_permission_events(self.store.as_ref(), permission_id).await?;
        if events.is_empty() {
            return Ok(None);
        }
        PermissionRequest::from_events(&events)
            .map(Some)
            .map_err(|e| EventStoreError::SerializationError(e.to_string()))
    }

    /// Replay `permission_id` and put the result back into the repository.
    async fn repair(&self, permission_id: &PermissionId) -> Result<Option<PermissionRequest>, EventStoreError> {
        let replayed = self.replay(permission_id).await?;
        if let Some(request) = &replayed {
            self.repository.save(request.clone()).await?;
            tracing::info!(
                permission_id = %permission_id,
                version = %request.version(),
                "Projection rebuilt from the event store"
            );
        }
        self.lagging.lock().await.remove(permission_id);
        Ok(replayed)
    }

    fn check(
        &self,
        current: Option<&PermissionRequest>,
        expected: Option<PermissionProcessStatus>,
        event: &PermissionEvent,
    ) -> Result<(), OutboxError> {
        let permission_id = event.permission_id();
        let Some(current) = current else {
            return if event.kind() == EventKind::Created {
                Ok(())
            } else {
                tracing::warn!(
                    permission_id = %permission_id,
                    event_type = event.event_type(),
                    "Event for unknown permission request rejected"
                );
                Err(OutboxError::UnknownPermission(permission_id.clone()))
            };
        };

        if event.kind() == EventKind::Created {
            return Err(OutboxError::AlreadyExists(permission_id.clone()));
        }

        if let Some(expected) = expected.filter(|expected| *expected != current.status()) {
            OutboxMetrics::record_status_conflict();
            tracing::warn!(
                permission_id = %permission_id,
                expected = %expected,
                actual = %current.status(),
                event_type = event.event_type(),
                "Permission request moved on, commit rejected"
            );
            return Err(OutboxError::StatusConflict {
                permission_id: permission_id.clone(),
                expected,
                actual: current.status(),
            });
        }

        let legal = match event.step() {
            Step::Transition(to) => self.table.allowed(current.status(), to),
            Step::Assertion(asserted) => asserted == current.status(),
        };
        if legal {
            Ok(())
        } else {
            OutboxMetrics::record_illegal_transition();
            let source = IllegalTransition {
                from: current.status(),
                to: event.status(),
            };
            tracing::error!(
                permission_id = %permission_id,
                from = %source.from,
                to = %source.to,
                event_type = event.event_type(),
                "Illegal transition attempted"
            );
            Err(OutboxError::IllegalTransition {
                permission_id: permission_id.clone(),
                source,
            })
        }
    }

    async fn commit_locked(
        &self,
        expected: Option<PermissionProcessStatus>,
        event: PermissionEvent,
    ) -> Result<PermissionRequest, OutboxError> {
        let started = Instant::now();
        let permission_id = event.permission_id().clone();
        let current = self.current(&permission_id).await?;
        let next = match self.append(current, expected, &event).await {
            Err(OutboxError::Store(EventStoreError::ConcurrencyConflict { expected: seen, actual, .. })) => {
                tracing::warn!(
                    permission_id = %permission_id,
                    projected = %seen,
                    stored = %actual,
                    "Projection behind the event store, replaying"
                );
                let current = self.repair(&permission_id).await?;
                self.append(current, expected, &event).await?
            },
            other => other?,
        };

        if let Err(error) = self.repository.save(next.clone()).await {
            self.lagging.lock().await.insert(permission_id.clone());
            tracing::error!(
                permission_id = %permission_id,
                event_type = event.event_type(),
                error = %error,
                "Event committed but projection not saved"
            );
            return Err(error.into());
        }

        if let Err(error) = self.bus.publish(&event) {
            tracing::warn!(
                permission_id = %permission_id,
                event_type = event.event_type(),
                error = %error,
                "Committed event could not be published; it stays recoverable by replay"
            );
        }

        OutboxMetrics::record_commit(event.event_type(), started.elapsed());
        tracing::debug!(
            permission_id = %permission_id,
            status = %next.status(),
            version = %next.version(),
            event_type = event.event_type(),
            "Event committed"
        );
        Ok(next)
    }

    /// Check `event` against `current` and append it at the version following `current`.
    async fn append(
        &self,
        current: Option<PermissionRequest>,
        expected: Option<PermissionProcessStatus>,
        event: &PermissionEvent,
    ) -> Result<PermissionRequest, OutboxError> {
        let permission_id = event.permission_id();
        self.check(current.as_ref(), expected, event)?;

        let next = match current {
            Some(mut request) => {
                request.apply(event);
                request
            },
            None => PermissionRequest::from_creation(event)
                .ok_or_else(|| OutboxError::UnknownPermission(permission_id.clone()))?,
        };

        let serialized = event
            .to_serialized()
            .map_err(|e| EventStoreError::SerializationError(e.to_string()))?;
        let expected_version = consent_core::stream::Version::new(next.version().value() - 1);
        self.store
            .append(permission_id.clone(), Some(expected_version), vec![serialized])
            .await?;
        Ok(next)
    }
}

impl Outbox for TransactionalOutbox {
    fn commit_expecting(
        &self,
        expected: Option<PermissionProcessStatus>,
        event: PermissionEvent,
    ) -> BoxFuture<'_, Result<PermissionRequest, OutboxError>> {
        Box::pin(async move {
            let permission_id = event.permission_id().clone();
            let lock = self.lock_for(&permission_id).await;
            let result = {
                let _guard = lock.lock().await;
                self.commit_locked(expected, event).await
            };
            self.release(&permission_id, lock).await;
            result
        })
    }
}

impl std::fmt::Debug for TransactionalOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalOutbox").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::bus::InProcessEventBus;
    use crate::memory::{InMemoryEventStore, InMemoryPermissionRequestRepository};
    use chrono::{NaiveDate, Utc};
    use consent_core::event::EventPayload;
    use consent_core::request::{DataSourceInformation, RequestedWindow, ValidityWindow};
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};

    type Pending<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

    /// Repository whose next save fails once when armed.
    #[derive(Default)]
    struct FlakyRepository {
        inner: InMemoryPermissionRequestRepository,
        fail_next_save: AtomicBool,
    }

    impl PermissionRequestRepository for FlakyRepository {
        fn find_by_permission_id<'a>(
            &'a self,
            permission_id: &'a PermissionId,
        ) -> Pending<'a, Option<PermissionRequest>> {
            self.inner.find_by_permission_id(permission_id)
        }

        fn save(&self, request: PermissionRequest) -> Pending<'_, ()> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                return Box::pin(async { Err(EventStoreError::Storage("disk full".into())) });
            }
            self.inner.save(request)
        }

        fn find_by_status(&self, status: PermissionProcessStatus) -> Pending<'_, Vec<PermissionRequest>> {
            self.inner.find_by_status(status)
        }

        fn find_stale(
            &self,
            status: PermissionProcessStatus,
            older_than: chrono::DateTime<Utc>,
        ) -> Pending<'_, Vec<PermissionRequest>> {
            self.inner.find_stale(status, older_than)
        }

        fn clear(&self) -> Pending<'_, ()> {
            self.inner.clear()
        }
    }

    struct Fixture {
        store: InMemoryEventStore,
        repository: InMemoryPermissionRequestRepository,
        outbox: TransactionalOutbox,
    }

    fn fixture() -> Fixture {
        let store = InMemoryEventStore::new();
        let repository = InMemoryPermissionRequestRepository::new();
        let outbox = TransactionalOutbox::new(
            Arc::new(store.clone()),
            Arc::new(repository.clone()),
            Arc::new(InProcessEventBus::new(1)),
            Arc::new(TransitionTable::canonical()),
        );
        Fixture {
            store,
            repository,
            outbox,
        }
    }

    fn event(payload: EventPayload) -> PermissionEvent {
        PermissionEvent::new(PermissionId::new("pid"), payload, Utc::now())
    }

    fn created() -> PermissionEvent {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        event(EventPayload::Created {
            connection_id: "cid".into(),
            data_need_id: "dnid".into(),
            data_source: DataSourceInformation {
                country_code: "AT".into(),
                region_connector_id: "at-eda".into(),
                permission_administrator_id: "pa".into(),
                meter_data_administrator_id: "mda".into(),
            },
            requested_window: RequestedWindow::Absolute { start: date, end: date },
            metering_point: None,
            granularity: None,
            extensions: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn illegal_edge_is_rejected_and_not_stored() {
        let f = fixture();
        f.outbox.commit(created()).await.unwrap();

        let error = f
            .outbox
            .commit(event(EventPayload::Accepted {
                external_reference: None,
            }))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            OutboxError::IllegalTransition {
                source: IllegalTransition {
                    from: PermissionProcessStatus::Created,
                    to: PermissionProcessStatus::Accepted,
                },
                ..
            }
        ));
        assert_eq!(f.store.event_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_and_duplicate_ids_are_rejected() {
        let f = fixture();
        let unknown = f.outbox.commit(event(EventPayload::TimedOut)).await.unwrap_err();
        assert!(matches!(unknown, OutboxError::UnknownPermission(_)));

        f.outbox.commit(created()).await.unwrap();
        let duplicate = f.outbox.commit(created()).await.unwrap_err();
        assert!(matches!(duplicate, OutboxError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn expected_status_is_compared() {
        let f = fixture();
        f.outbox.commit(created()).await.unwrap();

        let error = f
            .outbox
            .commit_expecting(
                Some(PermissionProcessStatus::Validated),
                event(EventPayload::Malformed { errors: Vec::new() }),
            )
            .await
            .unwrap_err();

        assert!(error.is_conflict());
    }

    fn validated() -> PermissionEvent {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        event(EventPayload::Validated {
            window: ValidityWindow { start: date, end: date },
            granularity: None,
        })
    }

    #[tokio::test]
    async fn failed_projection_save_does_not_wedge_the_request() {
        let store = InMemoryEventStore::new();
        let repository = Arc::new(FlakyRepository::default());
        let outbox = TransactionalOutbox::new(
            Arc::new(store.clone()),
            repository.clone(),
            Arc::new(InProcessEventBus::new(1)),
            Arc::new(TransitionTable::canonical()),
        );
        outbox.commit(created()).await.unwrap();

        repository.fail_next_save.store(true, Ordering::SeqCst);
        let error = outbox.commit(validated()).await.unwrap_err();
        assert!(matches!(error, OutboxError::Store(EventStoreError::Storage(_))));
        assert_eq!(store.event_count().await, 2);

        // The next commit sees the stored VALIDATED, not the stale CREATED projection.
        let sent = outbox
            .commit_expecting(
                Some(PermissionProcessStatus::Validated),
                event(EventPayload::Sent {
                    external_reference: None,
                    awaiting_acknowledgement: false,
                }),
            )
            .await
            .unwrap();
        assert_eq!(sent.status(), PermissionProcessStatus::SentToPermissionAdministrator);
        assert_eq!(sent.version().value(), 3);

        let projected = repository
            .find_by_permission_id(&PermissionId::new("pid"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(projected.version().value(), 3);
    }

    #[tokio::test]
    async fn projection_behind_the_store_is_replayed_on_conflict() {
        let f = fixture();
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        f.outbox.commit(created()).await.unwrap();
        f.outbox.commit(validated()).await.unwrap();
        f.outbox
            .commit(event(EventPayload::Sent {
                external_reference: None,
                awaiting_acknowledgement: false,
            }))
            .await
            .unwrap();
        f.outbox
            .commit(event(EventPayload::Accepted {
                external_reference: None,
            }))
            .await
            .unwrap();
        // Another writer appends behind the projection's back.
        let reading = event(EventPayload::DataReceived { start: date, end: date });
        let store: &dyn EventStore = &f.store;
        store
            .append(PermissionId::new("pid"), None, vec![reading.to_serialized().unwrap()])
            .await
            .unwrap();

        let request = f.outbox.commit(reading).await.unwrap();

        assert_eq!(request.status(), PermissionProcessStatus::Accepted);
        assert_eq!(request.version().value(), 6);
        assert_eq!(f.store.event_count().await, 6);
    }

    #[tokio::test]
    async fn projection_is_rebuilt_from_store_when_missing() {
        let f = fixture();
        f.outbox.commit(created()).await.unwrap();
        f.repository.clear().await.unwrap();

        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let request = f
            .outbox
            .commit(event(EventPayload::Validated {
                window: consent_core::request::ValidityWindow { start: date, end: date },
                granularity: None,
            }))
            .await
            .unwrap();

        assert_eq!(request.status(), PermissionProcessStatus::Validated);
        assert_eq!(request.version().value(), 2);
    }
}
