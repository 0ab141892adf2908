//! In-memory event store and repository.
//!
//! Both are `HashMap`-backed and cheap to clone (shared `Arc` state). They are
//! the default backends of the engine and the backends of every test; hosts
//! with durable storage implement the same traits.

use chrono::{DateTime, Utc};
use consent_core::event::SerializedEvent;
use consent_core::event_store::{EventStore, EventStoreError};
use consent_core::repository::PermissionRequestRepository;
use consent_core::request::PermissionRequest;
use consent_core::status::PermissionProcessStatus;
use consent_core::stream::{PermissionId, Version};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory event store with optimistic concurrency.
///
/// # Example
///
/// ```
/// use consent_core::event_store::EventStore;
/// use consent_core::stream::PermissionId;
/// use consent_runtime::memory::InMemoryEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let events = store.replay(PermissionId::new("unknown")).await?;
/// assert!(events.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<PermissionId, Vec<SerializedEvent>>>>,
}

impl InMemoryEventStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streams.
    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Whether the store holds no events.
    pub async fn is_empty(&self) -> bool {
        self.streams.read().await.is_empty()
    }

    /// Total number of stored events across all streams.
    pub async fn event_count(&self) -> usize {
        self.streams.read().await.values().map(Vec::len).sum()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        permission_id: PermissionId,
        expected_version: Option<Version>,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut streams = self.streams.write().await;
            let stream = streams.entry(permission_id.clone()).or_default();
            let actual = Version::new(stream.len() as u64);

            if let Some(expected) = expected_version {
                if expected != actual {
                    return Err(EventStoreError::ConcurrencyConflict {
                        permission_id,
                        expected,
                        actual,
                    });
                }
            }

            stream.extend(events);
            let version = Version::new(stream.len() as u64);
            if stream.is_empty() {
                streams.remove(&permission_id);
            }
            Ok(version)
        })
    }

    fn replay(
        &self,
        permission_id: PermissionId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SerializedEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .streams
                .read()
                .await
                .get(&permission_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn stream_ids(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PermissionId>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut ids: Vec<PermissionId> = self.streams.read().await.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }
}

type RepositoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

/// In-memory projection of the latest aggregate per permission id.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPermissionRequestRepository {
    requests: Arc<RwLock<HashMap<PermissionId, PermissionRequest>>>,
}

impl InMemoryPermissionRequestRepository {
    /// Create a new empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests.
    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Whether the repository is empty.
    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }
}

impl PermissionRequestRepository for InMemoryPermissionRequestRepository {
    fn find_by_permission_id<'a>(
        &'a self,
        permission_id: &'a PermissionId,
    ) -> RepositoryFuture<'a, Option<PermissionRequest>> {
        Box::pin(async move { Ok(self.requests.read().await.get(permission_id).cloned()) })
    }

    fn save(&self, request: PermissionRequest) -> RepositoryFuture<'_, ()> {
        Box::pin(async move {
            self.requests
                .write()
                .await
                .insert(request.permission_id().clone(), request);
            Ok(())
        })
    }

    fn find_by_status(&self, status: PermissionProcessStatus) -> RepositoryFuture<'_, Vec<PermissionRequest>> {
        Box::pin(async move {
            let mut found: Vec<PermissionRequest> = self
                .requests
                .read()
                .await
                .values()
                .filter(|request| request.status() == status)
                .cloned()
                .collect();
            found.sort_by(|a, b| a.permission_id().cmp(b.permission_id()));
            Ok(found)
        })
    }

    fn find_stale(
        &self,
        status: PermissionProcessStatus,
        older_than: DateTime<Utc>,
    ) -> RepositoryFuture<'_, Vec<PermissionRequest>> {
        Box::pin(async move {
            let mut found: Vec<PermissionRequest> = self
                .requests
                .read()
                .await
                .values()
                .filter(|request| request.status() == status && request.status_changed() < older_than)
                .cloned()
                .collect();
            found.sort_by_key(PermissionRequest::status_changed);
            Ok(found)
        })
    }

    fn clear(&self) -> RepositoryFuture<'_, ()> {
        Box::pin(async move {
            self.requests.write().await.clear();
            Ok(())
        })
    }
}
