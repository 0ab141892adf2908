//! Typed in-process publish/subscribe between the outbox and the sagas.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  State operation │
//! └────────┬─────────┘
//!          │ commit(event)
//!          ▼
//! ┌──────────────────┐
//! │ 1. Append event  │◄─── Source of truth
//! │  (event store)   │
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ 2. Publish on    │◄─── Ordered per permission id
//! │    event bus     │
//! └────────┬─────────┘
//!          │
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌───────┐ ┌───────┐
//! │ Saga  │ │ Saga  │
//! └───────┘ └───────┘
//! ```
//!
//! # Guarantees
//!
//! - **Persist first**: only committed events are published.
//! - **Ordered per permission id**: one handler sees the events of one request
//!   in commit order.
//! - **Isolated failures**: a failing handler never blocks delivery to other
//!   handlers and never propagates to the publisher; the failure is logged.
//! - **At-least-once**: handlers must tolerate duplicates.

use crate::environment::BoxFuture;
use crate::error::StateError;
use crate::event::{EventKind, PermissionEvent};
use crate::event_store::EventStoreError;
use std::sync::Arc;
use thiserror::Error;

/// Errors a handler may report. They are logged by the bus, never returned to
/// the publisher.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// A state operation or commit failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// The projection or event store could not be read.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// An external collaborator failed in a way the saga has no follow-up event for.
    #[error("Collaborator failed: {0}")]
    Collaborator(String),

    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Errors raised by the bus itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// The bus was shut down and accepts no more events.
    #[error("Event bus is closed")]
    Closed,
}

/// Which events a subscription receives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Exactly one event kind.
    Kind(EventKind),
    /// Every permission event.
    All,
}

impl EventFilter {
    /// Whether `event` passes this filter.
    #[must_use]
    pub fn matches(&self, event: &PermissionEvent) -> bool {
        match self {
            Self::Kind(kind) => event.kind() == *kind,
            Self::All => true,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}

/// A saga step reacting to one event kind.
pub trait EventHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// React to one committed event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] for failures that have no follow-up event; the
    /// bus logs them with the permission id and event type.
    fn handle<'a>(&'a self, event: &'a PermissionEvent) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Handle identifying one subscription.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Type-filtered publish/subscribe channel.
pub trait EventBus: Send + Sync {
    /// Register `handler` for every event passing `filter`.
    fn subscribe(&self, filter: EventFilter, handler: Arc<dyn EventHandler>) -> SubscriptionId;

    /// Hand `event` to every matching subscription. Returns without waiting
    /// for the handlers.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Closed`] after shutdown.
    fn publish(&self, event: &PermissionEvent) -> Result<(), EventBusError>;
}
