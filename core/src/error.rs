//! Error types shared across the lifecycle engine.

use crate::event_store::EventStoreError;
use crate::status::PermissionProcessStatus;
use crate::stream::PermissionId;
use crate::transition::IllegalTransition;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One failed validation: which attribute and why.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeError {
    /// Name of the offending attribute, e.g. `"start"`.
    pub name: String,
    /// Human-readable explanation.
    pub message: String,
}

impl AttributeError {
    /// Create a new attribute error.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for AttributeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Which side of an API boundary is responsible for an error.
///
/// Hosts map [`ErrorClass::Client`] to a 4xx-class response and
/// [`ErrorClass::Server`] to a 5xx-class response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller sent something unusable.
    Client,
    /// The engine or one of its collaborators failed.
    Server,
}

/// Errors raised while committing an event through the outbox.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The event addresses a permission request that was never created.
    #[error("Unknown permission request: {0}")]
    UnknownPermission(PermissionId),

    /// A creation event was committed for an id that already exists.
    #[error("Permission request {0} already exists")]
    AlreadyExists(PermissionId),

    /// The request moved on since the caller looked at it; the caller lost a race.
    #[error("Permission request {permission_id} is {actual}, expected {expected}")]
    StatusConflict {
        /// The addressed request.
        permission_id: PermissionId,
        /// Status the caller based its decision on.
        expected: PermissionProcessStatus,
        /// Status the request is actually in.
        actual: PermissionProcessStatus,
    },

    /// The event asks for an edge the transition table does not contain.
    #[error("Illegal transition for permission request {permission_id}: {source}")]
    IllegalTransition {
        /// The addressed request.
        permission_id: PermissionId,
        /// The rejected edge.
        source: IllegalTransition,
    },

    /// The event store failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl OutboxError {
    /// Whether this error only means that another writer got there first.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::StatusConflict { .. })
    }

    /// Boundary classification of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownPermission(_)
            | Self::AlreadyExists(_)
            | Self::StatusConflict { .. } => ErrorClass::Client,
            Self::IllegalTransition { .. } | Self::Store(_) => ErrorClass::Server,
        }
    }
}

/// Errors signalled to the caller of a state operation.
#[derive(Error, Debug)]
pub enum StateError {
    /// Input failed validation. Raised by `validate()` after the malformed
    /// fact was committed, and by operations rejecting inconsistent arguments.
    #[error("Validation failed: {}", join_errors(errors))]
    Validation {
        /// Every failed validation, in validator order.
        errors: Vec<AttributeError>,
    },

    /// Submission to the permission administrator failed; the request is now `UNABLE_TO_SEND`.
    #[error("Could not send permission request to the permission administrator: {cause}")]
    Submission {
        /// Whether the caller can fix the problem (4xx) or should retry later (5xx).
        caller_fault: bool,
        /// Collaborator-provided description.
        cause: String,
    },

    /// The follow-up event could not be committed.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

impl StateError {
    /// Boundary classification of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } => ErrorClass::Client,
            Self::Submission { caller_fault, .. } => {
                if *caller_fault {
                    ErrorClass::Client
                } else {
                    ErrorClass::Server
                }
            },
            Self::Outbox(error) => error.class(),
        }
    }

    /// Whether this error only means that another writer got there first.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Outbox(error) if error.is_conflict())
    }
}

fn join_errors(errors: &[AttributeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
