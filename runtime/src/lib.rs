//! # Consent Runtime
//!
//! Runtime of the permission request lifecycle engine.
//!
//! This crate provides the imperative shell around `consent-core`: storage,
//! the transactional outbox, the in-process event bus, the saga handlers and
//! the composition root that wires them together.
//!
//! ## Core Components
//!
//! - **Outbox**: checks every event against the transition table, appends it,
//!   updates the projection and publishes it
//! - **Event Bus**: ordered per permission id, isolated per handler
//! - **Sagas**: react to events, call collaborators, commit follow-up events
//! - **Sweeper**: times out requests the customer never answered
//! - **Poller**: fetches outstanding metering data of accepted requests
//! - **Engine**: the facade hosts talk to
//!
//! ## Example
//!
//! ```
//! use consent_core::PermissionProcessStatus;
//! use consent_runtime::EngineBuilder;
//! use consent_testing::helpers::new_request;
//! use consent_testing::{ScriptedAdministrator, test_clock};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let administrator = Arc::new(ScriptedAdministrator::new());
//! let engine = EngineBuilder::new()
//!     .with_clock(Arc::new(test_clock()))
//!     .with_administrator(administrator.clone())
//!     .build()?;
//!
//! let created = engine.create(new_request()).await?;
//! let permission_id = created.request().permission_id().clone();
//! engine.validate(created).await?;
//!
//! // Sagas take it from here
//! engine.settle().await;
//! assert_eq!(administrator.submit_calls(), 1);
//! assert_eq!(
//!     engine.request(&permission_id).await?.status(),
//!     PermissionProcessStatus::SentToPermissionAdministrator
//! );
//! # Ok(())
//! # }
//! ```

/// In-process event bus
pub mod bus;

/// Configuration from the environment
pub mod config;

/// Composition root and facade
pub mod engine;

/// In-memory event store and repository
pub mod memory;

/// Metrics for observability
pub mod metrics;

/// Transactional outbox
pub mod outbox;

/// Metering data poller
pub mod poller;

/// Retry logic with exponential backoff
pub mod retry;

/// Saga handlers
pub mod sagas;

/// Stale request sweeper
pub mod sweeper;

/// In-flight work tracking
pub mod tracking;

pub use bus::InProcessEventBus;
pub use config::{ConfigError, EngineConfig};
pub use engine::{CorruptedStream, EngineBuilder, EngineError, PermissionEngine, RecoveryReport};
pub use memory::{InMemoryEventStore, InMemoryPermissionRequestRepository};
pub use outbox::TransactionalOutbox;
pub use poller::{FetchOutcome, MeterDataPoller, PollReport};
pub use retry::RetryPolicy;
pub use sweeper::{StaleRequestSweeper, SweepReport};
pub use tracking::InFlight;
