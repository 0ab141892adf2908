//! # Consent Core
//!
//! Domain types and ports of the permission request lifecycle engine.
//!
//! A *permission request* is a customer's authorization for the platform to
//! fetch their own metering data from an energy-data ecosystem for a bounded
//! window. Many country-specific region connectors drive the same lifecycle;
//! this crate holds that shared lifecycle and nothing country-specific.
//!
//! ## Core Concepts
//!
//! - **Status**: closed set of lifecycle statuses ([`status`])
//! - **Transition Table**: immutable graph of allowed status changes plus a
//!   walk checker for event histories ([`transition`])
//! - **Event**: immutable fact committed for one permission id ([`event`])
//! - **Aggregate**: the left fold of a request's events ([`request`])
//! - **State Variants**: one type per status exposing only its legal
//!   operations ([`state`])
//! - **Ports**: event store, outbox, event bus, repository and external
//!   collaborators, injected as trait objects
//!
//! ## Architecture Principles
//!
//! - Persist first, then publish
//! - Mutation only by committing events
//! - Illegal edges fail loudly, never coerce
//! - Dependency injection via traits
//!
//! The runtime pieces (in-memory store, outbox, bus, sagas) live in
//! `consent-runtime`.

pub mod environment;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod outbox;
pub mod repository;
pub mod request;
pub mod state;
pub mod status;
pub mod stream;
pub mod transition;
pub mod validation;

pub use chrono::{DateTime, NaiveDate, Utc};
pub use error::{AttributeError, ErrorClass, OutboxError, StateError};
pub use event::{EventKind, EventPayload, PermissionEvent};
pub use request::PermissionRequest;
pub use status::PermissionProcessStatus;
pub use stream::{PermissionId, Version};
pub use transition::TransitionTable;
