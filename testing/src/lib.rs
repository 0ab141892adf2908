//! # Consent Testing
//!
//! Testing utilities for the permission request lifecycle engine.
//!
//! This crate provides:
//! - Scripted doubles of the external collaborators
//! - Fixtures for requests and event streams
//! - Property-based testing strategies over the status graph
//! - Tracing initialisation for tests
//!
//! ## Example
//!
//! ```
//! use consent_core::PermissionProcessStatus as Status;
//! use consent_core::environment::{Clock, MeterDataError, MeterDataSource};
//! use consent_core::request::PermissionRequest;
//! use consent_core::stream::PermissionId;
//! use consent_testing::helpers::{events_for, past_window};
//! use consent_testing::{ScriptedMeterDataSource, test_clock};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let walk = [Status::Created, Status::Validated];
//! let events = events_for(&PermissionId::new("p1"), &walk, test_clock().now());
//! let request = PermissionRequest::from_events(&events).unwrap();
//!
//! let source = ScriptedMeterDataSource::new();
//! source.push(Err(MeterDataError::Transient("backend busy".into())));
//!
//! assert!(source.fetch(&request, past_window()).await.is_err());
//! let reading = source.fetch(&request, past_window()).await.unwrap();
//! assert_eq!(reading.map(|reading| reading.end), Some(past_window().end));
//! assert_eq!(source.calls(), 2);
//! # }
//! ```

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Scripted doubles of the engine's collaborators.
pub mod mocks;

/// Fixtures for requests and event streams.
pub mod helpers;

/// Property-based testing utilities using proptest.
pub mod properties;

// Re-export commonly used items
pub use mocks::{FixedClock, ScriptedAdministrator, ScriptedMeterDataSource, test_clock};

/// Install a test-friendly `tracing` subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // Another test harness may already have installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
