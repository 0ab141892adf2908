//! The single write path into the engine.
//!
//! `commit` appends an event to the durable log and only then publishes it.
//! Implementations serialize commits per permission id and reject every event
//! whose status change is not an edge of the transition table.

use crate::environment::BoxFuture;
use crate::error::OutboxError;
use crate::event::PermissionEvent;
use crate::request::PermissionRequest;
use crate::status::PermissionProcessStatus;

/// Persist-then-publish commit of permission events.
pub trait Outbox: Send + Sync {
    /// Commit `event` if the request is currently in `expected` (when given)
    /// and the status change is allowed.
    ///
    /// Returns the projection of the request after the event.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::StatusConflict`] if the request is no longer in `expected`
    /// - [`OutboxError::IllegalTransition`] if the table forbids the change
    /// - [`OutboxError::UnknownPermission`] / [`OutboxError::AlreadyExists`] for
    ///   non-creation events of unknown ids and duplicate creations
    /// - [`OutboxError::Store`] if the event store fails
    fn commit_expecting(
        &self,
        expected: Option<PermissionProcessStatus>,
        event: PermissionEvent,
    ) -> BoxFuture<'_, Result<PermissionRequest, OutboxError>>;

    /// Commit `event` without a compare-and-swap on the current status.
    ///
    /// # Errors
    ///
    /// See [`Outbox::commit_expecting`].
    fn commit(&self, event: PermissionEvent) -> BoxFuture<'_, Result<PermissionRequest, OutboxError>> {
        self.commit_expecting(None, event)
    }
}
