//! Periodic timeout of requests the customer never answered.
//!
//! The sweeper looks up requests that have been waiting in
//! `SENT_TO_PERMISSION_ADMINISTRATOR` longer than the configured threshold and
//! times them out. An acceptance arriving at the same moment is arbitrated by
//! the outbox: whichever commit comes second loses with a status conflict,
//! which the sweeper counts and otherwise ignores.

use crate::metrics::SagaMetrics;
use chrono::{DateTime, Utc};
use consent_core::environment::Clock;
use consent_core::event_store::EventStoreError;
use consent_core::repository::PermissionRequestRepository;
use consent_core::state::{PermissionRequestState, StateContext};
use consent_core::status::PermissionProcessStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale requests found.
    pub examined: usize,
    /// Requests moved to `TIMED_OUT`.
    pub timed_out: usize,
    /// Requests that moved on before the timeout was committed.
    pub conflicts: usize,
    /// Requests whose timeout failed for another reason.
    pub failed: usize,
}

/// Times out stale `SENT_TO_PERMISSION_ADMINISTRATOR` requests.
#[derive(Clone)]
pub struct StaleRequestSweeper {
    state: StateContext,
    repository: Arc<dyn PermissionRequestRepository>,
    stale_after: chrono::Duration,
    interval: Duration,
}

impl StaleRequestSweeper {
    /// Create a new sweeper.
    #[must_use]
    pub fn new(
        state: StateContext,
        repository: Arc<dyn PermissionRequestRepository>,
        stale_after: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            repository,
            stale_after,
            interval,
        }
    }

    /// Time out every request that has been waiting since before `now - stale_after`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if the repository cannot be queried.
    /// Failures of individual timeouts are logged and counted in the report.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, EventStoreError> {
        let cutoff = now - self.stale_after;
        let stale = self
            .repository
            .find_stale(PermissionProcessStatus::SentToPermissionAdministrator, cutoff)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };
        for request in stale {
            let permission_id = request.permission_id().clone();
            let PermissionRequestState::Sent(sent) = PermissionRequestState::from_request(request) else {
                continue;
            };
            match sent.time_out(&self.state).await {
                Ok(_) => report.timed_out += 1,
                Err(error) if error.is_conflict() => {
                    tracing::debug!(permission_id = %permission_id, "Stale request answered before timeout");
                    report.conflicts += 1;
                },
                Err(error) => {
                    tracing::error!(permission_id = %permission_id, error = %error, "Could not time out stale request");
                    report.failed += 1;
                },
            }
        }

        SagaMetrics::record_timed_out(report.timed_out);
        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                timed_out = report.timed_out,
                conflicts = report.conflicts,
                failed = report.failed,
                "Stale request sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every interval until `shutdown` turns `true`.
    pub async fn run(&self, clock: Arc<dyn Clock>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Starting stale request sweeper");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.sweep_once(clock.now()).await {
                        tracing::error!(error = %error, "Stale request sweep failed");
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!("Stale request sweeper stopped");
    }
}

impl std::fmt::Debug for StaleRequestSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleRequestSweeper")
            .field("stale_after", &self.stale_after)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
