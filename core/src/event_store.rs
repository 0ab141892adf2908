//! Append-only event store with optimistic concurrency.
//!
//! The event store is the source of truth of the engine: one stream per
//! permission request, events in commit order, never edited. The transactional
//! outbox is its only writer.
//!
//! # Example
//!
//! ```no_run
//! use consent_core::event_store::{EventStore, EventStoreError};
//! use consent_core::stream::{PermissionId, Version};
//!
//! async fn example<E: EventStore>(store: &E) -> Result<(), EventStoreError> {
//!     let permission_id = PermissionId::new("pid-1");
//!
//!     let events = vec![/* ... */];
//!     let new_version = store
//!         .append(permission_id.clone(), Some(Version::INITIAL), events)
//!         .await?;
//!
//!     let stream = store.replay(permission_id).await?;
//!     assert_eq!(stream.len() as u64, new_version.value());
//!     Ok(())
//! }
//! ```

use crate::event::{PermissionEvent, SerializedEvent};
use crate::stream::{PermissionId, Version};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Optimistic concurrency check failed: the stream moved on since it was read.
    #[error("Concurrency conflict on {permission_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The stream that had the conflict.
        permission_id: PermissionId,
        /// The version the caller expected.
        expected: Version,
        /// The actual current version.
        actual: Version,
    },

    /// Backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored event could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Storage for permission event streams.
///
/// # Concurrency
///
/// `append` compares `expected_version` with the stream's current
/// version and fails with [`EventStoreError::ConcurrencyConflict`] on mismatch.
/// `None` skips the check.
pub trait EventStore: Send + Sync {
    /// Append events to the stream of `permission_id`.
    ///
    /// Returns the stream version after the append.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::ConcurrencyConflict`] if the version check fails
    /// - [`EventStoreError::Storage`] if the backend fails
    fn append(
        &self,
        permission_id: PermissionId,
        expected_version: Option<Version>,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>>;

    /// Load every event of one stream in commit order.
    ///
    /// An unknown stream yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if the backend fails.
    fn replay(
        &self,
        permission_id: PermissionId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SerializedEvent>, EventStoreError>> + Send + '_>>;

    /// Ids of every stream that has at least one event.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] if the backend fails.
    fn stream_ids(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PermissionId>, EventStoreError>> + Send + '_>>;
}

/// Load and decode the full stream of one permission request.
///
/// # Errors
///
/// Propagates backend errors and maps decoding failures to
/// [`EventStoreError::SerializationError`].
pub async fn load_permission_events<S>(
    store: &S,
    permission_id: &PermissionId,
) -> Result<Vec<PermissionEvent>, EventStoreError>
where
    S: EventStore + ?Sized,
{
    store
        .replay(permission_id.clone())
        .await?
        .iter()
        .map(|serialized| {
            PermissionEvent::from_serialized(serialized)
                .map_err(|e| EventStoreError::SerializationError(e.to_string()))
        })
        .collect()
}
