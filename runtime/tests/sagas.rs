//! Follow-up behavior driven by the event bus.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use chrono::Duration as ChronoDuration;
use common::{fast_config, fast_retry, harness, harness_with};
use consent_core::environment::{Clock, MeterDataError, MeterReading, SubmissionError, SubmissionErrorKind};
use consent_core::event::EventKind;
use consent_core::event_bus::EventBus;
use consent_core::state::PermissionRequestState;
use consent_core::PermissionProcessStatus as Status;
use consent_runtime::EngineConfig;
use consent_testing::helpers::{date, new_request};
use consent_testing::{ScriptedAdministrator, ScriptedMeterDataSource};
use std::time::Duration;

fn unavailable() -> SubmissionError {
    SubmissionError::new(SubmissionErrorKind::Unavailable, "maintenance window")
}

#[tokio::test]
async fn validated_request_is_sent() {
    let h = harness();
    let permission_id = h.sent().await;

    assert_eq!(h.administrator.submitted(), vec![permission_id.clone()]);
    let request = h.engine.request(&permission_id).await.unwrap();
    assert_eq!(request.status(), Status::SentToPermissionAdministrator);
}

#[tokio::test]
async fn transient_send_failure_is_retried() {
    let administrator = ScriptedAdministrator::new();
    administrator.push_submit(Err(unavailable()));
    let h = harness_with(fast_config(), administrator, None);

    let permission_id = h.sent().await;

    assert_eq!(h.administrator.submit_calls(), 2);
    assert_eq!(
        h.statuses(&permission_id).await,
        vec![
            Status::Created,
            Status::Validated,
            Status::UnableToSend,
            Status::Validated,
            Status::SentToPermissionAdministrator,
        ]
    );
}

#[tokio::test]
async fn send_retries_stop_when_the_budget_is_spent() {
    let administrator = ScriptedAdministrator::new();
    administrator.set_submit_fallback(Err(unavailable()));
    let h = harness_with(fast_config(), administrator, None);

    let permission_id = h.sent().await;

    // The first attempt plus three retries.
    assert_eq!(h.administrator.submit_calls(), 4);
    let request = h.engine.request(&permission_id).await.unwrap();
    assert_eq!(request.status(), Status::UnableToSend);
    assert_eq!(request.send_failures(), 4);
}

#[tokio::test]
async fn caller_fault_is_not_retried() {
    let administrator = ScriptedAdministrator::new();
    administrator.push_submit(Err(SubmissionError::new(
        SubmissionErrorKind::InvalidRequest,
        "unknown metering point",
    )));
    let h = harness_with(fast_config(), administrator, None);

    let permission_id = h.sent().await;

    assert_eq!(h.administrator.submit_calls(), 1);
    let request = h.engine.request(&permission_id).await.unwrap();
    assert_eq!(request.status(), Status::UnableToSend);
    assert!(request.last_failure().is_some_and(|cause| cause.contains("unknown metering point")));
}

#[tokio::test]
async fn duplicate_validated_event_does_not_resubmit() {
    let h = harness();
    let permission_id = h.sent().await;

    let validated = h
        .engine
        .events(&permission_id)
        .await
        .unwrap()
        .into_iter()
        .find(|event| event.kind() == EventKind::Validated)
        .unwrap();
    h.engine.bus().publish(&validated).unwrap();
    h.engine.settle().await;

    assert_eq!(h.administrator.submit_calls(), 1);
    assert_eq!(h.engine.events(&permission_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn full_delivery_fulfills_the_permission() {
    let h = harness_with(fast_config(), ScriptedAdministrator::new(), Some(ScriptedMeterDataSource::new()));

    let permission_id = h.accepted().await;

    let request = h.engine.request(&permission_id).await.unwrap();
    assert_eq!(request.status(), Status::Fulfilled);
    assert_eq!(request.latest_meter_reading_end(), request.end());
    assert_eq!(h.administrator.terminate_calls(), 0);
}

#[tokio::test]
async fn fulfillment_can_terminate_externally() {
    let config = EngineConfig {
        terminate_on_fulfillment: true,
        ..fast_config()
    };
    let h = harness_with(config, ScriptedAdministrator::new(), Some(ScriptedMeterDataSource::new()));

    let permission_id = h.accepted().await;

    assert_eq!(h.administrator.terminate_calls(), 1);
    let statuses = h.statuses(&permission_id).await;
    assert_eq!(
        &statuses[statuses.len() - 3..],
        &[
            Status::Fulfilled,
            Status::RequiresExternalTermination,
            Status::ExternallyTerminated,
        ]
    );
}

#[tokio::test]
async fn permanent_meter_failure_is_unfulfillable() {
    let meter_data = ScriptedMeterDataSource::new();
    meter_data.push(Err(MeterDataError::Permanent("no smart meter installed".into())));
    let h = harness_with(fast_config(), ScriptedAdministrator::new(), Some(meter_data));

    let permission_id = h.accepted().await;

    let request = h.engine.request(&permission_id).await.unwrap();
    assert_eq!(request.status(), Status::Unfulfillable);
}

#[tokio::test]
async fn transient_meter_failure_keeps_the_permission_accepted() {
    let meter_data = ScriptedMeterDataSource::new();
    meter_data.push(Err(MeterDataError::Transient("backend busy".into())));
    let h = harness_with(fast_config(), ScriptedAdministrator::new(), Some(meter_data));

    let permission_id = h.accepted().await;

    let request = h.engine.request(&permission_id).await.unwrap();
    assert_eq!(request.status(), Status::Accepted);
    assert_eq!(h.meter_data.as_ref().unwrap().calls(), 1);
}

fn first_ten_days() -> MeterReading {
    MeterReading {
        start: date(2025, 1, 1),
        end: date(2025, 1, 10),
    }
}

#[tokio::test]
async fn transient_meter_failure_is_polled_again_after_backoff() {
    let meter_data = ScriptedMeterDataSource::new();
    meter_data.push(Err(MeterDataError::Transient("backend busy".into())));
    let h = harness_with(fast_config(), ScriptedAdministrator::new(), Some(meter_data));
    let permission_id = h.accepted().await;
    let poller = h.engine.poller().unwrap();

    // Still backing off.
    let report = poller.poll_once(h.clock.now()).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(h.meter_data.as_ref().unwrap().calls(), 1);

    h.clock.advance(ChronoDuration::minutes(2));
    let report = poller.poll_once(h.clock.now()).await.unwrap();
    h.engine.settle().await;

    assert_eq!(report.delivered, 1);
    assert_eq!(h.meter_data.as_ref().unwrap().calls(), 2);
    assert_eq!(h.engine.request(&permission_id).await.unwrap().status(), Status::Fulfilled);
}

#[tokio::test]
async fn poller_fetches_the_rest_of_a_partial_delivery() {
    let meter_data = ScriptedMeterDataSource::new();
    meter_data.push(Ok(Some(first_ten_days())));
    let h = harness_with(fast_config(), ScriptedAdministrator::new(), Some(meter_data));
    let permission_id = h.accepted().await;
    let request = h.engine.request(&permission_id).await.unwrap();
    assert_eq!(request.status(), Status::Accepted);
    assert_eq!(request.latest_meter_reading_end(), Some(date(2025, 1, 10)));

    let report = h.engine.poller().unwrap().poll_once(h.clock.now()).await.unwrap();
    h.engine.settle().await;

    assert_eq!(report.delivered, 1);
    let windows = h.meter_data.as_ref().unwrap().windows();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].start, date(2025, 1, 1));
    assert_eq!(windows[1].start, date(2025, 1, 11));
    assert_eq!(windows[1].end, date(2025, 1, 31));
    assert_eq!(h.engine.request(&permission_id).await.unwrap().status(), Status::Fulfilled);
}

#[tokio::test]
async fn poller_leaves_settled_requests_alone() {
    let h = harness_with(fast_config(), ScriptedAdministrator::new(), Some(ScriptedMeterDataSource::new()));
    h.accepted().await;

    let report = h.engine.poller().unwrap().poll_once(h.clock.now()).await.unwrap();

    assert_eq!(report.examined, 0);
    assert_eq!(h.meter_data.as_ref().unwrap().calls(), 1);
}

#[tokio::test]
async fn duplicate_accepted_event_does_not_fetch_again() {
    let meter_data = ScriptedMeterDataSource::new();
    meter_data.push(Ok(Some(first_ten_days())));
    let h = harness_with(fast_config(), ScriptedAdministrator::new(), Some(meter_data));
    let permission_id = h.accepted().await;

    let accepted = h
        .engine
        .events(&permission_id)
        .await
        .unwrap()
        .into_iter()
        .find(|event| event.kind() == EventKind::Accepted)
        .unwrap();
    h.engine.bus().publish(&accepted).unwrap();
    h.engine.settle().await;

    assert_eq!(h.meter_data.as_ref().unwrap().calls(), 1);
    assert_eq!(h.engine.events(&permission_id).await.unwrap().len(), 5);
}

#[tokio::test]
async fn revocation_during_meter_fetch_wins() {
    let meter_data = ScriptedMeterDataSource::new().with_latency(Duration::from_millis(100));
    let h = harness_with(fast_config(), ScriptedAdministrator::new(), Some(meter_data));
    let meter_data = h.meter_data.clone().unwrap();

    let permission_id = h.sent().await;
    let accepted = h
        .sent_state(&permission_id)
        .await
        .accept(h.engine.context(), None)
        .await
        .unwrap();
    while meter_data.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    accepted.revoke(h.engine.context()).await.unwrap();
    h.engine.settle().await;

    // The late reading lost against the revocation and was dropped.
    assert_eq!(
        h.engine.request(&permission_id).await.unwrap().status(),
        Status::Revoked
    );
    assert_eq!(h.statuses(&permission_id).await.last(), Some(&Status::Revoked));
}

#[tokio::test]
async fn failed_external_termination_is_retried() {
    let administrator = ScriptedAdministrator::new();
    administrator.push_terminate(Err(unavailable()));
    let h = harness_with(fast_config(), administrator, None);

    let permission_id = h.accepted().await;
    let PermissionRequestState::Accepted(accepted) = h.engine.state(&permission_id).await.unwrap() else {
        panic!("expected ACCEPTED");
    };
    accepted.terminate(h.engine.context(), None).await.unwrap();
    h.engine.settle().await;

    assert_eq!(h.administrator.terminate_calls(), 2);
    let statuses = h.statuses(&permission_id).await;
    assert_eq!(
        &statuses[4..],
        &[
            Status::Terminated,
            Status::RequiresExternalTermination,
            Status::FailedToTerminate,
            Status::RequiresExternalTermination,
            Status::ExternallyTerminated,
        ]
    );
}

#[tokio::test]
async fn termination_retries_are_bounded() {
    let administrator = ScriptedAdministrator::new();
    administrator.set_terminate_fallback(Err(unavailable()));
    let config = EngineConfig {
        termination_retry: fast_retry(2),
        ..fast_config()
    };
    let h = harness_with(config, administrator, None);

    let permission_id = h.accepted().await;
    let PermissionRequestState::Accepted(accepted) = h.engine.state(&permission_id).await.unwrap() else {
        panic!("expected ACCEPTED");
    };
    accepted.terminate(h.engine.context(), None).await.unwrap();
    h.engine.settle().await;

    assert_eq!(h.administrator.terminate_calls(), 3);
    let request = h.engine.request(&permission_id).await.unwrap();
    assert_eq!(request.status(), Status::FailedToTerminate);
    assert_eq!(request.termination_failures(), 3);
}

#[tokio::test]
async fn sweeper_times_out_stale_requests() {
    let h = harness();
    let stale = h.sent().await;
    h.clock.advance(ChronoDuration::hours(169));
    let fresh = h.sent().await;

    let report = h.engine.sweeper().sweep_once(h.clock.now()).await.unwrap();
    h.engine.settle().await;

    assert_eq!(report.examined, 1);
    assert_eq!(report.timed_out, 1);
    assert_eq!(h.engine.request(&stale).await.unwrap().status(), Status::TimedOut);
    assert_eq!(
        h.engine.request(&fresh).await.unwrap().status(),
        Status::SentToPermissionAdministrator
    );
}

#[tokio::test]
async fn answered_requests_are_not_swept() {
    let h = harness();
    let permission_id = h.sent().await;
    h.clock.advance(ChronoDuration::hours(200));

    let sweeper = h.engine.sweeper();
    let sent = h.sent_state(&permission_id).await;
    sent.accept(h.engine.context(), None).await.unwrap();
    let report = sweeper.sweep_once(h.clock.now()).await.unwrap();

    assert_eq!(report.timed_out, 0);
    assert_eq!(h.engine.request(&permission_id).await.unwrap().status(), Status::Accepted);
}

#[tokio::test]
async fn pending_acknowledgement_is_not_swept() {
    let administrator = ScriptedAdministrator::new();
    administrator.set_submit_fallback(Ok(consent_core::environment::Receipt {
        external_reference: Some("conversation-7".into()),
        awaiting_acknowledgement: true,
    }));
    let h = harness_with(fast_config(), administrator, None);
    let created = h.engine.create(new_request()).await.unwrap();
    let permission_id = created.request().permission_id().clone();
    h.engine.validate(created).await.unwrap();
    h.engine.settle().await;
    h.clock.advance(ChronoDuration::hours(500));

    let report = h.engine.sweeper().sweep_once(h.clock.now()).await.unwrap();

    assert_eq!(report.examined, 0);
    let PermissionRequestState::PendingAcknowledgement(pending) = h.engine.state(&permission_id).await.unwrap() else {
        panic!("expected PENDING_PERMISSION_ADMINISTRATOR_ACKNOWLEDGEMENT");
    };
    let sent = pending
        .received_permission_administrator_response(h.engine.context())
        .await
        .unwrap();
    assert_eq!(sent.request().external_reference(), Some("conversation-7"));
}
