//! External collaborators injected into the engine.
//!
//! Everything that talks to the outside world (time, the permission
//! administrator, metering data sources) is abstracted behind a trait so
//! country-specific connectors can plug in their protocol adapters and tests
//! can plug in scripted doubles.

use crate::request::{PermissionRequest, ValidityWindow};
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by the dyn-compatible collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Clock trait - abstracts time operations for testability.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Current calendar date in UTC.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// How a failed submission or termination should be treated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubmissionErrorKind {
    /// Credentials were rejected (HTTP 401/403-class).
    Unauthorized,
    /// The administrator refused the request content (HTTP 400-class).
    InvalidRequest,
    /// The administrator throttled us (HTTP 429).
    RateLimited,
    /// The administrator or the network failed (HTTP 5xx, timeouts).
    Unavailable,
}

impl SubmissionErrorKind {
    /// Whether the caller can fix this failure; such failures are never retried.
    #[must_use]
    pub const fn is_caller_fault(self) -> bool {
        matches!(self, Self::Unauthorized | Self::InvalidRequest)
    }
}

impl fmt::Display for SubmissionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unauthorized => "unauthorized",
            Self::InvalidRequest => "invalid request",
            Self::RateLimited => "rate limited",
            Self::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Failure reported by the permission administrator adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct SubmissionError {
    /// Classification of the failure.
    pub kind: SubmissionErrorKind,
    /// Adapter-provided description.
    pub message: String,
}

impl SubmissionError {
    /// Create a new submission error.
    #[must_use]
    pub fn new(kind: SubmissionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Successful hand-over of a request to the permission administrator.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Receipt {
    /// Correlation id assigned by the administrator.
    pub external_reference: Option<String>,
    /// Whether the administrator will still confirm receipt asynchronously.
    pub awaiting_acknowledgement: bool,
}

/// Outcome of a successful termination call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The administrator confirmed the termination synchronously.
    Confirmed,
    /// The administrator will confirm later through an acknowledgement message.
    AwaitingAcknowledgement,
}

/// The external authority that grants, rejects and terminates permissions.
pub trait PermissionAdministrator: Send + Sync {
    /// Submit a validated request.
    ///
    /// # Errors
    ///
    /// Returns a classified [`SubmissionError`] if the hand-over failed.
    fn submit<'a>(&'a self, request: &'a PermissionRequest)
    -> BoxFuture<'a, Result<Receipt, SubmissionError>>;

    /// Ask the administrator to terminate an accepted permission.
    ///
    /// # Errors
    ///
    /// Returns a classified [`SubmissionError`] if the termination failed.
    fn terminate<'a>(
        &'a self,
        request: &'a PermissionRequest,
    ) -> BoxFuture<'a, Result<TerminationOutcome, SubmissionError>>;
}

/// Failure to fetch metering data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeterDataError {
    /// The data will never be available (unknown metering point, no smart meter).
    #[error("Metering data permanently unavailable: {0}")]
    Permanent(String),

    /// The data may become available later.
    #[error("Metering data temporarily unavailable: {0}")]
    Transient(String),
}

/// A batch of metering data received for a permission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MeterReading {
    /// First day covered by the batch.
    pub start: NaiveDate,
    /// Last day covered by the batch.
    pub end: NaiveDate,
}

/// Third-party source of metering data for accepted permissions.
pub trait MeterDataSource: Send + Sync {
    /// Fetch whatever data is available for `window`.
    ///
    /// `Ok(None)` means nothing is available yet.
    ///
    /// # Errors
    ///
    /// Returns [`MeterDataError`] classified as permanent or transient.
    fn fetch<'a>(
        &'a self,
        request: &'a PermissionRequest,
        window: ValidityWindow,
    ) -> BoxFuture<'a, Result<Option<MeterReading>, MeterDataError>>;
}
