//! Periodic fetch of metering data for accepted permissions.
//!
//! The acceptance saga asks the meter data source once, right after a
//! permission was accepted. Everything after that first answer belongs to the
//! poller: every interval it looks at each `ACCEPTED` request and fetches the
//! part of its window not delivered yet, starting the day after the latest
//! reading. Transient failures push the next fetch of that request out with
//! the configured backoff. The schedule is kept per permission id, so a
//! duplicate `Accepted` delivery finds its fetch already claimed.

use crate::retry::RetryPolicy;
use crate::sagas::next_retry_delay;
use chrono::{DateTime, Utc};
use consent_core::environment::{Clock, MeterDataError, MeterDataSource};
use consent_core::error::StateError;
use consent_core::event_store::EventStoreError;
use consent_core::repository::PermissionRequestRepository;
use consent_core::state::{Accepted, PermissionRequestState, StateContext};
use consent_core::status::PermissionProcessStatus;
use consent_core::stream::PermissionId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

const RETRY_LOOP: &str = "meter-data";

/// What a single fetch led to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A reading was recorded.
    Delivered,
    /// Nothing to fetch anymore; the permission was fulfilled.
    Fulfilled,
    /// The source has nothing for the outstanding window yet.
    NothingYet,
    /// The data will never be available; the permission is unfulfillable.
    Unfulfillable,
    /// The source failed transiently; the next fetch is backed off.
    Unavailable,
}

/// Outcome of one poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Accepted requests found.
    pub examined: usize,
    /// Requests skipped because their backoff has not elapsed.
    pub deferred: usize,
    /// Readings recorded.
    pub delivered: usize,
    /// Requests fulfilled or found unfulfillable.
    pub settled: usize,
    /// Fetches that failed transiently.
    pub unavailable: usize,
    /// Requests that moved on before the result was committed.
    pub conflicts: usize,
    /// Commits that failed for another reason.
    pub failed: usize,
}

#[derive(Clone, Copy, Debug)]
struct Schedule {
    failures: u32,
    due: DateTime<Utc>,
    in_flight: bool,
}

/// Fetches outstanding metering data of `ACCEPTED` requests.
pub struct MeterDataPoller {
    state: StateContext,
    repository: Arc<dyn PermissionRequestRepository>,
    source: Arc<dyn MeterDataSource>,
    policy: RetryPolicy,
    interval: Duration,
    schedule: Mutex<HashMap<PermissionId, Schedule>>,
}

impl MeterDataPoller {
    /// Create a new poller.
    #[must_use]
    pub fn new(
        state: StateContext,
        repository: Arc<dyn PermissionRequestRepository>,
        source: Arc<dyn MeterDataSource>,
        policy: RetryPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            repository,
            source,
            policy,
            interval,
            schedule: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the first fetch of a freshly accepted permission.
    ///
    /// Returns `false` if a fetch was claimed before, so repeated
    /// `Accepted` deliveries do not fetch again.
    pub async fn claim_first(&self, permission_id: &PermissionId, now: DateTime<Utc>) -> bool {
        let mut schedule = self.schedule.lock().await;
        if schedule.contains_key(permission_id) {
            return false;
        }
        schedule.insert(
            permission_id.clone(),
            Schedule {
                failures: 0,
                due: now,
                in_flight: true,
            },
        );
        true
    }

    async fn claim_due(&self, permission_id: &PermissionId, now: DateTime<Utc>) -> bool {
        let mut schedule = self.schedule.lock().await;
        let entry = schedule.entry(permission_id.clone()).or_insert(Schedule {
            failures: 0,
            due: now,
            in_flight: false,
        });
        if entry.in_flight || entry.due > now {
            return false;
        }
        entry.in_flight = true;
        true
    }

    async fn release(&self, permission_id: &PermissionId, now: DateTime<Utc>, outcome: Option<FetchOutcome>) {
        let mut schedule = self.schedule.lock().await;
        match outcome {
            Some(FetchOutcome::Fulfilled | FetchOutcome::Unfulfillable) => {
                schedule.remove(permission_id);
            },
            Some(FetchOutcome::Unavailable) => {
                let entry = schedule.entry(permission_id.clone()).or_insert(Schedule {
                    failures: 0,
                    due: now,
                    in_flight: false,
                });
                entry.failures = entry.failures.saturating_add(1);
                let delay = next_retry_delay(&self.policy, RETRY_LOOP, entry.failures, permission_id)
                    .unwrap_or_else(|| self.policy.max_delay());
                let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
                entry.due = now.checked_add_signed(delay).unwrap_or(now);
                entry.in_flight = false;
            },
            Some(FetchOutcome::Delivered | FetchOutcome::NothingYet) => {
                if let Some(entry) = schedule.get_mut(permission_id) {
                    entry.failures = 0;
                    entry.due = now;
                    entry.in_flight = false;
                }
            },
            None => {
                if let Some(entry) = schedule.get_mut(permission_id) {
                    entry.in_flight = false;
                }
            },
        }
    }

    /// Fetch the outstanding window of `accepted` and commit what comes back.
    ///
    /// The fetch must have been claimed with [`MeterDataPoller::claim_first`]
    /// or by the poll itself; the claim is released here.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the follow-up commit fails. A conflict means
    /// the permission moved on while the source was asked.
    pub async fn fetch(&self, accepted: Accepted, now: DateTime<Utc>) -> Result<FetchOutcome, StateError> {
        let permission_id = accepted.request().permission_id().clone();
        let result = self.fetch_claimed(accepted).await;
        self.release(&permission_id, now, result.as_ref().ok().copied()).await;
        result
    }

    async fn fetch_claimed(&self, accepted: Accepted) -> Result<FetchOutcome, StateError> {
        let Some(window) = accepted.request().outstanding_window() else {
            if accepted.request().is_fully_delivered() {
                accepted.fulfill(&self.state).await?;
                return Ok(FetchOutcome::Fulfilled);
            }
            tracing::warn!(
                permission_id = %accepted.request().permission_id(),
                "Accepted permission request has no validity window"
            );
            return Ok(FetchOutcome::NothingYet);
        };

        let permission_id = accepted.request().permission_id().clone();
        match self.source.fetch(accepted.request(), window).await {
            Ok(Some(reading)) => {
                accepted
                    .record_data_received(&self.state, reading.start, reading.end)
                    .await?;
                Ok(FetchOutcome::Delivered)
            },
            Ok(None) => {
                tracing::debug!(permission_id = %permission_id, start = %window.start, "No metering data available yet");
                Ok(FetchOutcome::NothingYet)
            },
            Err(MeterDataError::Permanent(reason)) => {
                tracing::warn!(permission_id = %permission_id, reason = %reason, "Metering data will never be available");
                accepted.unfulfillable(&self.state, Some(reason)).await?;
                Ok(FetchOutcome::Unfulfillable)
            },
            Err(MeterDataError::Transient(reason)) => {
                tracing::warn!(permission_id = %permission_id, reason = %reason, "Metering data temporarily unavailable");
                Ok(FetchOutcome::Unavailable)
            },
        }
    }

    /// Fetch outstanding data of every accepted request whose backoff elapsed by `now`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError`] if the repository cannot be queried.
    /// Failures of individual commits are logged and counted in the report.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport, EventStoreError> {
        let accepted = self
            .repository
            .find_by_status(PermissionProcessStatus::Accepted)
            .await?;
        self.forget_all_but(&accepted.iter().map(|r| r.permission_id().clone()).collect())
            .await;

        let mut report = PollReport {
            examined: accepted.len(),
            ..PollReport::default()
        };
        for request in accepted {
            let permission_id = request.permission_id().clone();
            let PermissionRequestState::Accepted(accepted) = PermissionRequestState::from_request(request) else {
                continue;
            };
            if !self.claim_due(&permission_id, now).await {
                report.deferred += 1;
                continue;
            }
            match self.fetch(accepted, now).await {
                Ok(FetchOutcome::Delivered) => report.delivered += 1,
                Ok(FetchOutcome::Fulfilled | FetchOutcome::Unfulfillable) => report.settled += 1,
                Ok(FetchOutcome::NothingYet) => {},
                Ok(FetchOutcome::Unavailable) => report.unavailable += 1,
                Err(error) if error.is_conflict() => {
                    tracing::debug!(permission_id = %permission_id, "Permission moved on during metering data fetch");
                    report.conflicts += 1;
                },
                Err(error) => {
                    tracing::error!(permission_id = %permission_id, error = %error, "Could not record metering data");
                    report.failed += 1;
                },
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                deferred = report.deferred,
                delivered = report.delivered,
                settled = report.settled,
                unavailable = report.unavailable,
                conflicts = report.conflicts,
                failed = report.failed,
                "Metering data poll finished"
            );
        }
        Ok(report)
    }

    async fn forget_all_but(&self, accepted: &HashSet<PermissionId>) {
        self.schedule
            .lock()
            .await
            .retain(|permission_id, entry| entry.in_flight || accepted.contains(permission_id));
    }

    /// Poll every interval until `shutdown` turns `true`.
    pub async fn run(&self, clock: Arc<dyn Clock>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Starting metering data poller");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.poll_once(clock.now()).await {
                        tracing::error!(error = %error, "Metering data poll failed");
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

        tracing::info!("Metering data poller stopped");
    }
}

impl std::fmt::Debug for MeterDataPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeterDataPoller")
            .field("policy", &self.policy)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
