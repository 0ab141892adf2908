//! Fixtures for permission requests and their events.

use chrono::{DateTime, NaiveDate, Utc};
use consent_core::error::AttributeError;
use consent_core::event::{EventPayload, PermissionEvent};
use consent_core::request::{DataSourceInformation, Granularity, NewPermissionRequest, RequestedWindow, ValidityWindow};
use consent_core::status::PermissionProcessStatus;
use consent_core::stream::PermissionId;
use std::collections::BTreeMap;

/// A calendar date; out-of-range input yields the epoch.
#[must_use]
pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

/// January 2025, entirely before [`test_clock`](crate::test_clock).
#[must_use]
pub fn past_window() -> ValidityWindow {
    ValidityWindow {
        start: date(2025, 1, 1),
        end: date(2025, 1, 31),
    }
}

/// The data source every fixture request belongs to.
#[must_use]
pub fn data_source() -> DataSourceInformation {
    DataSourceInformation {
        country_code: "AT".to_string(),
        region_connector_id: "at-eda".to_string(),
        permission_administrator_id: "AT003000".to_string(),
        meter_data_administrator_id: "AT003000".to_string(),
    }
}

/// A creation request over [`past_window`] that passes the standard validators
/// at [`test_clock`](crate::test_clock).
#[must_use]
pub fn new_request() -> NewPermissionRequest {
    let window = past_window();
    new_request_for(RequestedWindow::Absolute {
        start: window.start,
        end: window.end,
    })
}

/// A creation request over `window`.
#[must_use]
pub fn new_request_for(window: RequestedWindow) -> NewPermissionRequest {
    NewPermissionRequest {
        connection_id: "connection-1".to_string(),
        data_need_id: "data-need-1".to_string(),
        data_source: data_source(),
        requested_window: window,
        metering_point: Some("AT0030000000000000000000000000001".to_string()),
        granularity: Some(Granularity::PT15M),
        extensions: BTreeMap::new(),
    }
}

/// A payload that moves a request into `status`.
#[must_use]
pub fn payload_for(status: PermissionProcessStatus) -> EventPayload {
    use PermissionProcessStatus as S;
    match status {
        S::Created => new_request().into_payload(),
        S::Validated => EventPayload::Validated {
            window: past_window(),
            granularity: None,
        },
        S::Malformed => EventPayload::Malformed {
            errors: vec![AttributeError::new("start", "is too old")],
        },
        S::UnableToSend => EventPayload::UnableToSend {
            cause: "unavailable: maintenance".to_string(),
            caller_fault: false,
        },
        S::SentToPermissionAdministrator => EventPayload::Sent {
            external_reference: Some("conversation-1".to_string()),
            awaiting_acknowledgement: false,
        },
        S::PendingPermissionAdministratorAcknowledgement => EventPayload::Sent {
            external_reference: Some("conversation-1".to_string()),
            awaiting_acknowledgement: true,
        },
        S::Accepted => EventPayload::Accepted {
            external_reference: None,
        },
        S::Rejected => EventPayload::Rejected { reason: None },
        S::Invalid => EventPayload::Invalid { reason: None },
        S::TimedOut => EventPayload::TimedOut,
        S::Fulfilled => EventPayload::Fulfilled,
        S::Unfulfillable => EventPayload::Unfulfillable { reason: None },
        S::Terminated => EventPayload::Terminated { reason: None },
        S::Revoked => EventPayload::Revoked,
        S::RequiresExternalTermination => EventPayload::RequiresExternalTermination,
        S::FailedToTerminate => EventPayload::FailedToTerminate {
            cause: "unavailable: maintenance".to_string(),
        },
        S::ExternallyTerminated => EventPayload::ExternallyTerminated,
    }
}

/// The events of a request walking through `statuses`, one second apart.
#[must_use]
pub fn events_for(
    permission_id: &PermissionId,
    statuses: &[PermissionProcessStatus],
    start: DateTime<Utc>,
) -> Vec<PermissionEvent> {
    statuses
        .iter()
        .zip(0_i64..)
        .map(|(status, offset)| {
            PermissionEvent::new(
                permission_id.clone(),
                payload_for(*status),
                start + chrono::Duration::seconds(offset),
            )
        })
        .collect()
}
