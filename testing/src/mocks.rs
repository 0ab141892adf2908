//! Scripted doubles of the engine's collaborators.
//!
//! Every double answers from a queue of scripted results first and falls back
//! to a configurable default once the queue is empty, and counts its calls.

use chrono::{DateTime, Duration, Utc};
use consent_core::environment::{
    BoxFuture, Clock, MeterDataError, MeterDataSource, MeterReading, PermissionAdministrator, Receipt,
    SubmissionError, TerminationOutcome,
};
use consent_core::request::{PermissionRequest, ValidityWindow};
use consent_core::stream::PermissionId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed clock for deterministic tests
///
/// Returns the same time until it is moved explicitly. Clones share the time.
///
/// # Example
///
/// ```
/// use consent_testing::mocks::FixedClock;
/// use consent_core::environment::Clock;
/// use chrono::{Duration, Utc};
///
/// let clock = FixedClock::new(Utc::now());
/// let time1 = clock.now();
/// assert_eq!(time1, clock.now());
///
/// clock.advance(Duration::hours(1));
/// assert_eq!(clock.now() - time1, Duration::hours(1));
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *lock(&self.time) += by;
    }

    /// Jump to `time`.
    pub fn set(&self, time: DateTime<Utc>) {
        *lock(&self.time) = time;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.time)
    }
}

/// Create a default fixed clock for tests (2025-03-01 12:00:00 UTC)
///
/// # Panics
///
/// This function will panic if the hardcoded timestamp fails to parse,
/// which should never happen in practice.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc),
    )
}

/// Permission administrator answering from a script.
///
/// Without a script every submission is confirmed synchronously and every
/// termination is confirmed.
#[derive(Debug)]
pub struct ScriptedAdministrator {
    submissions: Mutex<VecDeque<Result<Receipt, SubmissionError>>>,
    submit_fallback: Mutex<Result<Receipt, SubmissionError>>,
    terminations: Mutex<VecDeque<Result<TerminationOutcome, SubmissionError>>>,
    terminate_fallback: Mutex<Result<TerminationOutcome, SubmissionError>>,
    submitted: Mutex<Vec<PermissionId>>,
    terminate_calls: AtomicUsize,
    latency: Option<std::time::Duration>,
}

impl ScriptedAdministrator {
    /// An administrator confirming everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(VecDeque::new()),
            submit_fallback: Mutex::new(Ok(Receipt::default())),
            terminations: Mutex::new(VecDeque::new()),
            terminate_fallback: Mutex::new(Ok(TerminationOutcome::Confirmed)),
            submitted: Mutex::new(Vec::new()),
            terminate_calls: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Wait this long inside every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer the next unscripted submission with `result`.
    pub fn push_submit(&self, result: Result<Receipt, SubmissionError>) {
        lock(&self.submissions).push_back(result);
    }

    /// Answer every unscripted submission with `result`.
    pub fn set_submit_fallback(&self, result: Result<Receipt, SubmissionError>) {
        *lock(&self.submit_fallback) = result;
    }

    /// Answer the next unscripted termination with `result`.
    pub fn push_terminate(&self, result: Result<TerminationOutcome, SubmissionError>) {
        lock(&self.terminations).push_back(result);
    }

    /// Answer every unscripted termination with `result`.
    pub fn set_terminate_fallback(&self, result: Result<TerminationOutcome, SubmissionError>) {
        *lock(&self.terminate_fallback) = result;
    }

    /// Number of submissions so far.
    #[must_use]
    pub fn submit_calls(&self) -> usize {
        lock(&self.submitted).len()
    }

    /// Ids submitted so far, in call order.
    #[must_use]
    pub fn submitted(&self) -> Vec<PermissionId> {
        lock(&self.submitted).clone()
    }

    /// Number of termination calls so far.
    #[must_use]
    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for ScriptedAdministrator {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionAdministrator for ScriptedAdministrator {
    fn submit<'a>(&'a self, request: &'a PermissionRequest) -> BoxFuture<'a, Result<Receipt, SubmissionError>> {
        Box::pin(async move {
            self.wait().await;
            lock(&self.submitted).push(request.permission_id().clone());
            let scripted = lock(&self.submissions).pop_front();
            scripted.unwrap_or_else(|| lock(&self.submit_fallback).clone())
        })
    }

    fn terminate<'a>(
        &'a self,
        _request: &'a PermissionRequest,
    ) -> BoxFuture<'a, Result<TerminationOutcome, SubmissionError>> {
        Box::pin(async move {
            self.wait().await;
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            let scripted = lock(&self.terminations).pop_front();
            scripted.unwrap_or_else(|| lock(&self.terminate_fallback).clone())
        })
    }
}

/// Meter data source answering from a script.
///
/// Without a script it delivers the whole requested window at once.
#[derive(Debug, Default)]
pub struct ScriptedMeterDataSource {
    answers: Mutex<VecDeque<Result<Option<MeterReading>, MeterDataError>>>,
    calls: AtomicUsize,
    windows: Mutex<Vec<ValidityWindow>>,
    latency: Option<std::time::Duration>,
}

impl ScriptedMeterDataSource {
    /// A source delivering every window in full.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long inside every fetch.
    #[must_use]
    pub const fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer the next fetch with `answer`.
    pub fn push(&self, answer: Result<Option<MeterReading>, MeterDataError>) {
        lock(&self.answers).push_back(answer);
    }

    /// Number of fetches so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Windows asked for, in call order.
    #[must_use]
    pub fn windows(&self) -> Vec<ValidityWindow> {
        lock(&self.windows).clone()
    }
}

impl MeterDataSource for ScriptedMeterDataSource {
    fn fetch<'a>(
        &'a self,
        _request: &'a PermissionRequest,
        window: ValidityWindow,
    ) -> BoxFuture<'a, Result<Option<MeterReading>, MeterDataError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.windows).push(window);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let scripted = lock(&self.answers).pop_front();
            scripted.unwrap_or(Ok(Some(MeterReading {
                start: window.start,
                end: window.end,
            })))
        })
    }
}
