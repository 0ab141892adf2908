//! Identification and versioning of per-permission event streams.
//!
//! Every permission request owns exactly one event stream, addressed by its
//! [`PermissionId`]. [`Version`] counts the events committed to that stream and
//! backs the optimistic concurrency check of the event store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `PermissionId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid permission ID: {0}")]
pub struct ParsePermissionIdError(String);

/// Globally unique, stable identifier of a permission request.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty and whitespace-only input
/// - `From::from()` and `new()`: no validation (trusted, application-controlled input)
///
/// # Examples
///
/// ```
/// use consent_core::stream::PermissionId;
///
/// let id = PermissionId::new("pid-1");
/// assert_eq!(id.as_str(), "pid-1");
///
/// let parsed: PermissionId = "pid-2".parse().unwrap();
/// assert_eq!(parsed, PermissionId::new("pid-2"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionId(String);

impl PermissionId {
    /// Create a new `PermissionId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the permission ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `PermissionId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PermissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PermissionId {
    type Err = ParsePermissionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParsePermissionIdError(
                "Permission ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for PermissionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PermissionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for PermissionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Number of events committed to a permission stream.
///
/// A stream that does not exist yet is at [`Version::INITIAL`]. Appending `n`
/// events moves it to `version + n`.
///
/// # Examples
///
/// ```
/// use consent_core::stream::Version;
///
/// let v0 = Version::INITIAL;
/// assert_eq!(v0.next(), Version::new(1));
/// assert!(v0.is_initial());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a stream without events.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the initial version (0).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}
