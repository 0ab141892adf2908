//! The closed set of lifecycle statuses a permission request can be in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing an unknown status name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown permission process status: {0}")]
pub struct ParseStatusError(String);

/// Lifecycle status of a permission request.
///
/// The wire representation is the `SCREAMING_SNAKE_CASE` name used by every
/// region connector and by the outbound status notifications.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionProcessStatus {
    /// The request exists but has not been validated yet.
    Created,
    /// All validators passed.
    Validated,
    /// At least one validator failed.
    Malformed,
    /// Submission to the permission administrator failed.
    UnableToSend,
    /// The permission administrator received the request.
    SentToPermissionAdministrator,
    /// The request was handed over but the administrator has not confirmed receipt.
    PendingPermissionAdministratorAcknowledgement,
    /// The customer granted the permission.
    Accepted,
    /// The customer declined the permission.
    Rejected,
    /// The permission administrator considers the request invalid.
    Invalid,
    /// No answer arrived within the allowed time.
    TimedOut,
    /// All requested data was delivered.
    Fulfilled,
    /// The requested data can never be delivered.
    Unfulfillable,
    /// The eligible party terminated the permission.
    Terminated,
    /// The customer revoked the permission at the permission administrator.
    Revoked,
    /// The permission must still be terminated at the permission administrator.
    RequiresExternalTermination,
    /// Terminating the permission at the permission administrator failed.
    FailedToTerminate,
    /// The permission administrator confirmed the termination.
    ExternallyTerminated,
}

impl PermissionProcessStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 17] = [
        Self::Created,
        Self::Validated,
        Self::Malformed,
        Self::UnableToSend,
        Self::SentToPermissionAdministrator,
        Self::PendingPermissionAdministratorAcknowledgement,
        Self::Accepted,
        Self::Rejected,
        Self::Invalid,
        Self::TimedOut,
        Self::Fulfilled,
        Self::Unfulfillable,
        Self::Terminated,
        Self::Revoked,
        Self::RequiresExternalTermination,
        Self::FailedToTerminate,
        Self::ExternallyTerminated,
    ];

    /// The canonical wire name of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Validated => "VALIDATED",
            Self::Malformed => "MALFORMED",
            Self::UnableToSend => "UNABLE_TO_SEND",
            Self::SentToPermissionAdministrator => "SENT_TO_PERMISSION_ADMINISTRATOR",
            Self::PendingPermissionAdministratorAcknowledgement => {
                "PENDING_PERMISSION_ADMINISTRATOR_ACKNOWLEDGEMENT"
            },
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::Invalid => "INVALID",
            Self::TimedOut => "TIMED_OUT",
            Self::Fulfilled => "FULFILLED",
            Self::Unfulfillable => "UNFULFILLABLE",
            Self::Terminated => "TERMINATED",
            Self::Revoked => "REVOKED",
            Self::RequiresExternalTermination => "REQUIRES_EXTERNAL_TERMINATION",
            Self::FailedToTerminate => "FAILED_TO_TERMINATE",
            Self::ExternallyTerminated => "EXTERNALLY_TERMINATED",
        }
    }
}

impl fmt::Display for PermissionProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionProcessStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}
