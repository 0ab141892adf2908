//! Read-side projection of permission requests.
//!
//! The repository holds the latest folded [`PermissionRequest`] per
//! permission id. The outbox is its only writer; handlers, the sweeper and
//! interactive lookups read from it.

use crate::event_store::EventStoreError;
use crate::request::PermissionRequest;
use crate::status::PermissionProcessStatus;
use crate::stream::PermissionId;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

type RepositoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

/// Aggregate repository consumed by the engine.
pub trait PermissionRequestRepository: Send + Sync {
    /// Look up one request.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if the backend fails.
    fn find_by_permission_id<'a>(
        &'a self,
        permission_id: &'a PermissionId,
    ) -> RepositoryFuture<'a, Option<PermissionRequest>>;

    /// Insert or replace the projection of one request.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if the backend fails.
    fn save(&self, request: PermissionRequest) -> RepositoryFuture<'_, ()>;

    /// Every request currently in `status`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if the backend fails.
    fn find_by_status(&self, status: PermissionProcessStatus) -> RepositoryFuture<'_, Vec<PermissionRequest>>;

    /// Requests in `status` whose status last changed before `older_than`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if the backend fails.
    fn find_stale(
        &self,
        status: PermissionProcessStatus,
        older_than: DateTime<Utc>,
    ) -> RepositoryFuture<'_, Vec<PermissionRequest>>;

    /// Drop every projection; used before a full rebuild from the event store.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if the backend fails.
    fn clear(&self) -> RepositoryFuture<'_, ()>;
}
