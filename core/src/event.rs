//! Permission events and their storage encoding.
//!
//! Every change to a permission request is recorded as an immutable
//! [`PermissionEvent`]. The event carries the status the request is in after
//! the event, the time the event was created, and a typed [`EventPayload`].
//! The status is derived from the payload when the event is built, so a
//! payload can never disagree with the status it claims.
//!
//! # Storage
//!
//! Events are stored as [`SerializedEvent`]s: a stable, versioned type name
//! plus the `bincode` bytes of the event. Metadata (permission id and status)
//! is kept as JSON next to the bytes so stores can be inspected without
//! decoding.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use consent_core::event::{Event, EventPayload, PermissionEvent};
//! use consent_core::status::PermissionProcessStatus;
//! use consent_core::stream::PermissionId;
//!
//! let event = PermissionEvent::new(
//!     PermissionId::new("pid"),
//!     EventPayload::Sent { external_reference: None, awaiting_acknowledgement: true },
//!     Utc::now(),
//! );
//! assert_eq!(event.status(), PermissionProcessStatus::PendingPermissionAdministratorAcknowledgement);
//! assert_eq!(event.event_type(), "PermissionEvent.Sent.v1");
//! ```

use crate::error::AttributeError;
use crate::request::{DataSourceInformation, Granularity, RequestedWindow, ValidityWindow};
use crate::status::PermissionProcessStatus;
use crate::stream::PermissionId;
use crate::transition::Step;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered during deserialization.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// An event that can be stored in an event store and replayed to reconstruct state.
///
/// `event_type()` returns a stable identifier with a version suffix
/// (`"PermissionEvent.Accepted.v1"`) so schemas can evolve.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// were produced by an incompatible schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// A serialized event ready for storage.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// The event type identifier (e.g. `"PermissionEvent.Created.v1"`).
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata in JSON format.
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Create a serialized event from an `Event`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// Typed content of a permission event.
///
/// Each variant implies the status the request is in after the event; see
/// [`EventPayload::status`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    /// A customer asked for a new permission.
    Created {
        /// Owning customer session.
        connection_id: String,
        /// Requested data contract.
        data_need_id: String,
        /// Owning authority, country and connector.
        data_source: DataSourceInformation,
        /// Window as requested by the customer.
        requested_window: RequestedWindow,
        /// Metering point, if the connector uses one.
        metering_point: Option<String>,
        /// Requested resolution, if already known.
        granularity: Option<Granularity>,
        /// Connector-specific fields.
        extensions: BTreeMap<String, String>,
    },
    /// Every validator passed.
    Validated {
        /// The resolved validity window.
        window: ValidityWindow,
        /// Resolution agreed during validation.
        granularity: Option<Granularity>,
    },
    /// At least one validator failed.
    Malformed {
        /// Every failed validation.
        errors: Vec<AttributeError>,
    },
    /// The request reached the permission administrator.
    Sent {
        /// Correlation id returned by the administrator.
        external_reference: Option<String>,
        /// Whether the administrator still has to confirm receipt.
        awaiting_acknowledgement: bool,
    },
    /// Submission failed.
    UnableToSend {
        /// Collaborator-provided description.
        cause: String,
        /// Whether the caller can fix the problem.
        caller_fault: bool,
    },
    /// The customer granted the permission.
    Accepted {
        /// Correlation id carried by the answer.
        external_reference: Option<String>,
    },
    /// The customer declined.
    Rejected {
        /// Reason given by the administrator.
        reason: Option<String>,
    },
    /// The administrator considers the request invalid.
    Invalid {
        /// Reason given by the administrator.
        reason: Option<String>,
    },
    /// No answer arrived in time.
    TimedOut,
    /// Metering data for a period arrived; the request stays `ACCEPTED`.
    DataReceived {
        /// First day of the delivered data.
        start: NaiveDate,
        /// Last day of the delivered data.
        end: NaiveDate,
    },
    /// Every requested day was delivered.
    Fulfilled,
    /// The data can never be delivered.
    Unfulfillable {
        /// Why delivery is impossible.
        reason: Option<String>,
    },
    /// The eligible party terminated the permission.
    Terminated {
        /// Why it was terminated.
        reason: Option<String>,
    },
    /// The customer revoked the permission at the administrator.
    Revoked,
    /// The permission must still be terminated at the administrator.
    RequiresExternalTermination,
    /// The administrator confirmed the termination.
    ExternallyTerminated,
    /// Terminating at the administrator failed.
    FailedToTerminate {
        /// Collaborator-provided description.
        cause: String,
    },
}

impl EventPayload {
    /// Kind of this payload, used to route events to subscribers.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Created { .. } => EventKind::Created,
            Self::Validated { .. } => EventKind::Validated,
            Self::Malformed { .. } => EventKind::Malformed,
            Self::Sent { .. } => EventKind::Sent,
            Self::UnableToSend { .. } => EventKind::UnableToSend,
            Self::Accepted { .. } => EventKind::Accepted,
            Self::Rejected { .. } => EventKind::Rejected,
            Self::Invalid { .. } => EventKind::Invalid,
            Self::TimedOut => EventKind::TimedOut,
            Self::DataReceived { .. } => EventKind::DataReceived,
            Self::Fulfilled => EventKind::Fulfilled,
            Self::Unfulfillable { .. } => EventKind::Unfulfillable,
            Self::Terminated { .. } => EventKind::Terminated,
            Self::Revoked => EventKind::Revoked,
            Self::RequiresExternalTermination => EventKind::RequiresExternalTermination,
            Self::ExternallyTerminated => EventKind::ExternallyTerminated,
            Self::FailedToTerminate { .. } => EventKind::FailedToTerminate,
        }
    }

    /// Status the request is in after this payload was committed.
    #[must_use]
    pub const fn status(&self) -> PermissionProcessStatus {
        use PermissionProcessStatus as S;
        match self {
            Self::Created { .. } => S::Created,
            Self::Validated { .. } => S::Validated,
            Self::Malformed { .. } => S::Malformed,
            Self::Sent {
                awaiting_acknowledgement: true,
                ..
            } => S::PendingPermissionAdministratorAcknowledgement,
            Self::Sent { .. } => S::SentToPermissionAdministrator,
            Self::UnableToSend { .. } => S::UnableToSend,
            Self::Accepted { .. } | Self::DataReceived { .. } => S::Accepted,
            Self::Rejected { .. } => S::Rejected,
            Self::Invalid { .. } => S::Invalid,
            Self::TimedOut => S::TimedOut,
            Self::Fulfilled => S::Fulfilled,
            Self::Unfulfillable { .. } => S::Unfulfillable,
            Self::Terminated { .. } => S::Terminated,
            Self::Revoked => S::Revoked,
            Self::RequiresExternalTermination => S::RequiresExternalTermination,
            Self::ExternallyTerminated => S::ExternallyTerminated,
            Self::FailedToTerminate { .. } => S::FailedToTerminate,
        }
    }
}

/// Routing key of a permission event.
///
/// Handlers subscribe to one kind, or to every event via
/// [`EventFilter::All`](crate::event_bus::EventFilter::All).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// See [`EventPayload::Created`].
    Created,
    /// See [`EventPayload::Validated`].
    Validated,
    /// See [`EventPayload::Malformed`].
    Malformed,
    /// See [`EventPayload::Sent`]; covers both sent and pending acknowledgement.
    Sent,
    /// See [`EventPayload::UnableToSend`].
    UnableToSend,
    /// See [`EventPayload::Accepted`].
    Accepted,
    /// See [`EventPayload::Rejected`].
    Rejected,
    /// See [`EventPayload::Invalid`].
    Invalid,
    /// See [`EventPayload::TimedOut`].
    TimedOut,
    /// See [`EventPayload::DataReceived`].
    DataReceived,
    /// See [`EventPayload::Fulfilled`].
    Fulfilled,
    /// See [`EventPayload::Unfulfillable`].
    Unfulfillable,
    /// See [`EventPayload::Terminated`].
    Terminated,
    /// See [`EventPayload::Revoked`].
    Revoked,
    /// See [`EventPayload::RequiresExternalTermination`].
    RequiresExternalTermination,
    /// See [`EventPayload::ExternallyTerminated`].
    ExternallyTerminated,
    /// See [`EventPayload::FailedToTerminate`].
    FailedToTerminate,
}

impl EventKind {
    /// Versioned storage name of events of this kind.
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::Created => "PermissionEvent.Created.v1",
            Self::Validated => "PermissionEvent.Validated.v1",
            Self::Malformed => "PermissionEvent.Malformed.v1",
            Self::Sent => "PermissionEvent.Sent.v1",
            Self::UnableToSend => "PermissionEvent.UnableToSend.v1",
            Self::Accepted => "PermissionEvent.Accepted.v1",
            Self::Rejected => "PermissionEvent.Rejected.v1",
            Self::Invalid => "PermissionEvent.Invalid.v1",
            Self::TimedOut => "PermissionEvent.TimedOut.v1",
            Self::DataReceived => "PermissionEvent.DataReceived.v1",
            Self::Fulfilled => "PermissionEvent.Fulfilled.v1",
            Self::Unfulfillable => "PermissionEvent.Unfulfillable.v1",
            Self::Terminated => "PermissionEvent.Terminated.v1",
            Self::Revoked => "PermissionEvent.Revoked.v1",
            Self::RequiresExternalTermination => "PermissionEvent.RequiresExternalTermination.v1",
            Self::ExternallyTerminated => "PermissionEvent.ExternallyTerminated.v1",
            Self::FailedToTerminate => "PermissionEvent.FailedToTerminate.v1",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An immutable fact about one permission request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEvent {
    permission_id: PermissionId,
    status: PermissionProcessStatus,
    event_created: DateTime<Utc>,
    payload: EventPayload,
}

impl PermissionEvent {
    /// Create an event; the status is taken from the payload.
    #[must_use]
    pub fn new(permission_id: PermissionId, payload: EventPayload, event_created: DateTime<Utc>) -> Self {
        Self {
            permission_id,
            status: payload.status(),
            event_created,
            payload,
        }
    }

    /// The request this event belongs to.
    #[must_use]
    pub const fn permission_id(&self) -> &PermissionId {
        &self.permission_id
    }

    /// Status of the request after this event.
    #[must_use]
    pub const fn status(&self) -> PermissionProcessStatus {
        self.status
    }

    /// When the event was created.
    #[must_use]
    pub const fn event_created(&self) -> DateTime<Utc> {
        self.event_created
    }

    /// Typed content.
    #[must_use]
    pub const fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Routing key.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// How this event moves the status of its request.
    ///
    /// Data-received facts assert the current status instead of changing it.
    #[must_use]
    pub const fn step(&self) -> Step {
        match self.payload {
            EventPayload::DataReceived { .. } => Step::Assertion(self.status),
            _ => Step::Transition(self.status),
        }
    }

    /// Encode this event for storage.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if encoding fails.
    pub fn to_serialized(&self) -> Result<SerializedEvent, EventError> {
        SerializedEvent::from_event(
            self,
            Some(serde_json::json!({
                "permission_id": self.permission_id.as_str(),
                "status": self.status.as_str(),
            })),
        )
    }

    /// Decode an event previously produced by [`PermissionEvent::to_serialized`].
    ///
    /// # Errors
    ///
    /// Returns `EventError::UnknownEventType` if the stored type name does not
    /// match the decoded payload, and `EventError::DeserializationError` if the
    /// bytes cannot be decoded.
    pub fn from_serialized(serialized: &SerializedEvent) -> Result<Self, EventError> {
        let event = Self::from_bytes(&serialized.data)?;
        if event.event_type() != serialized.event_type {
            return Err(EventError::UnknownEventType(serialized.event_type.clone()));
        }
        Ok(event)
    }
}

impl Event for PermissionEvent {
    fn event_type(&self) -> &'static str {
        self.kind().event_type()
    }
}

impl fmt::Display for PermissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.kind(), self.permission_id, self.status)
    }
}
