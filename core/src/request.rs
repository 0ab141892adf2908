//! The permission request aggregate and its value types.
//!
//! A [`PermissionRequest`] is never written field by field from the outside.
//! It is the left fold of its committed [`PermissionEvent`]s, rebuilt by
//! [`PermissionRequest::from_events`] and advanced by
//! [`PermissionRequest::apply`].

use crate::event::{EventPayload, PermissionEvent};
use crate::status::PermissionProcessStatus;
use crate::stream::{PermissionId, Version};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Resolution of the metering data a permission request asks for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Granularity {
    /// Five minutes.
    PT5M,
    /// Ten minutes.
    PT10M,
    /// Fifteen minutes.
    PT15M,
    /// Thirty minutes.
    PT30M,
    /// One hour.
    PT1H,
    /// One day.
    P1D,
    /// One month.
    P1M,
    /// One year.
    P1Y,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which authority, country and connector own a permission request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSourceInformation {
    /// ISO 3166 country code, e.g. `"AT"`.
    pub country_code: String,
    /// Identifier of the region connector driving the request.
    pub region_connector_id: String,
    /// Identifier of the permission administrator.
    pub permission_administrator_id: String,
    /// Identifier of the meter data administrator.
    pub meter_data_administrator_id: String,
}

/// Resolved, absolute validity window (both bounds inclusive).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// First day covered.
    pub start: NaiveDate,
    /// Last day covered.
    pub end: NaiveDate,
}

/// Validity window as requested by the customer.
///
/// Relative windows are resolved against the current date when the request
/// is validated, so two requests with the same data need may cover different
/// days.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestedWindow {
    /// Fixed calendar dates.
    Absolute {
        /// First day covered.
        start: NaiveDate,
        /// Last day covered.
        end: NaiveDate,
    },
    /// Offsets in days from the validation date; negative values lie in the past.
    Relative {
        /// Offset of the first day.
        start_offset_days: i64,
        /// Offset of the last day.
        end_offset_days: i64,
    },
}

impl RequestedWindow {
    /// Resolve the window against `today`.
    ///
    /// Offsets that would leave chrono's supported date range saturate at `today`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::NaiveDate;
    /// use consent_core::request::RequestedWindow;
    ///
    /// let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
    /// let window = RequestedWindow::Relative { start_offset_days: -10, end_offset_days: -1 }
    ///     .resolve(today);
    /// assert_eq!(window.start, NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
    /// assert_eq!(window.end, NaiveDate::from_ymd_opt(2025, 3, 9).unwrap());
    /// ```
    #[must_use]
    pub fn resolve(&self, today: NaiveDate) -> ValidityWindow {
        match *self {
            Self::Absolute { start, end } => ValidityWindow { start, end },
            Self::Relative {
                start_offset_days,
                end_offset_days,
            } => ValidityWindow {
                start: offset(today, start_offset_days),
                end: offset(today, end_offset_days),
            },
        }
    }
}

fn offset(today: NaiveDate, days: i64) -> NaiveDate {
    let shifted = Days::new(days.unsigned_abs());
    let moved = if days < 0 {
        today.checked_sub_days(shifted)
    } else {
        today.checked_add_days(shifted)
    };
    moved.unwrap_or(today)
}

/// Everything needed to create a permission request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPermissionRequest {
    /// Owning customer session.
    pub connection_id: String,
    /// Requested data contract.
    pub data_need_id: String,
    /// Owning authority, country and connector.
    pub data_source: DataSourceInformation,
    /// Window as requested by the customer.
    pub requested_window: RequestedWindow,
    /// Metering point, if the connector uses one.
    pub metering_point: Option<String>,
    /// Requested resolution, if already known.
    pub granularity: Option<Granularity>,
    /// Connector-specific fields.
    pub extensions: BTreeMap<String, String>,
}

impl NewPermissionRequest {
    /// The creation fact for this request.
    #[must_use]
    pub fn into_payload(self) -> EventPayload {
        EventPayload::Created {
            connection_id: self.connection_id,
            data_need_id: self.data_need_id,
            data_source: self.data_source,
            requested_window: self.requested_window,
            metering_point: self.metering_point,
            granularity: self.granularity,
            extensions: self.extensions,
        }
    }
}

/// Errors raised while rebuilding an aggregate from its events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// No events were supplied.
    #[error("Cannot rebuild a permission request without events")]
    Empty,

    /// The first event is not a creation fact.
    #[error("First event of {0} is not a creation event")]
    MissingCreation(PermissionId),

    /// An event of another permission request was mixed into the stream.
    #[error("Event of {found} found in stream of {expected}")]
    ForeignEvent {
        /// Stream being rebuilt.
        expected: PermissionId,
        /// Id carried by the foreign event.
        found: PermissionId,
    },
}

/// Aggregate root: one customer's request to access their own metering data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    permission_id: PermissionId,
    connection_id: String,
    data_need_id: String,
    status: PermissionProcessStatus,
    created: DateTime<Utc>,
    status_changed: DateTime<Utc>,
    requested_window: RequestedWindow,
    window: Option<ValidityWindow>,
    data_source: DataSourceInformation,
    metering_point: Option<String>,
    granularity: Option<Granularity>,
    extensions: BTreeMap<String, String>,
    external_reference: Option<String>,
    latest_meter_reading_end: Option<NaiveDate>,
    errors: Vec<crate::error::AttributeError>,
    last_failure: Option<String>,
    send_failures: u32,
    termination_failures: u32,
    version: Version,
}

impl PermissionRequest {
    /// Rebuild an aggregate by folding its events in commit order.
    ///
    /// The fold trusts the order and legality of the events; checking the walk
    /// against the transition table is the caller's job.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] if the stream is empty, does not start with a
    /// creation event, or mixes events of different requests.
    pub fn from_events<'a, I>(events: I) -> Result<Self, ReplayError>
    where
        I: IntoIterator<Item = &'a PermissionEvent>,
    {
        let mut events = events.into_iter();
        let first = events.next().ok_or(ReplayError::Empty)?;
        let mut request = Self::from_creation(first)
            .ok_or_else(|| ReplayError::MissingCreation(first.permission_id().clone()))?;
        for event in events {
            if event.permission_id() != &request.permission_id {
                return Err(ReplayError::ForeignEvent {
                    expected: request.permission_id.clone(),
                    found: event.permission_id().clone(),
                });
            }
            request.apply(event);
        }
        Ok(request)
    }

    /// Build a fresh aggregate from its creation event.
    ///
    /// Returns `None` if `event` is not a creation fact.
    #[must_use]
    pub fn from_creation(event: &PermissionEvent) -> Option<Self> {
        let EventPayload::Created {
            connection_id,
            data_need_id,
            data_source,
            requested_window,
            metering_point,
            granularity,
            extensions,
        } = event.payload()
        else {
            return None;
        };
        Some(Self {
            permission_id: event.permission_id().clone(),
            connection_id: connection_id.clone(),
            data_need_id: data_need_id.clone(),
            status: event.status(),
            created: event.event_created(),
            status_changed: event.event_created(),
            requested_window: *requested_window,
            window: None,
            data_source: data_source.clone(),
            metering_point: metering_point.clone(),
            granularity: *granularity,
            extensions: extensions.clone(),
            external_reference: None,
            latest_meter_reading_end: None,
            errors: Vec::new(),
            last_failure: None,
            send_failures: 0,
            termination_failures: 0,
            version: Version::new(1),
        })
    }

    /// Advance the aggregate by one committed event.
    pub fn apply(&mut self, event: &PermissionEvent) {
        self.version = self.version.next();
        if event.status() != self.status {
            self.status_changed = event.event_created();
        }
        self.status = event.status();

        match event.payload() {
            EventPayload::Created { .. }
            | EventPayload::TimedOut
            | EventPayload::Fulfilled
            | EventPayload::Revoked
            | EventPayload::RequiresExternalTermination
            | EventPayload::ExternallyTerminated => {},
            EventPayload::Validated {
                window,
                granularity,
            } => {
                self.window = Some(*window);
                if granularity.is_some() {
                    self.granularity = *granularity;
                }
            },
            EventPayload::Malformed { errors } => self.errors.clone_from(errors),
            EventPayload::Sent {
                external_reference, ..
            }
            | EventPayload::Accepted { external_reference } => {
                if external_reference.is_some() {
                    self.external_reference.clone_from(external_reference);
                }
            },
            EventPayload::UnableToSend { cause, .. } => {
                self.send_failures += 1;
                self.last_failure = Some(cause.clone());
            },
            EventPayload::FailedToTerminate { cause } => {
                self.termination_failures += 1;
                self.last_failure = Some(cause.clone());
            },
            EventPayload::Rejected { reason }
            | EventPayload::Invalid { reason }
            | EventPayload::Unfulfillable { reason }
            | EventPayload::Terminated { reason } => {
                self.last_failure.clone_from(reason);
            },
            EventPayload::DataReceived { end, .. } => {
                if self.latest_meter_reading_end.is_none_or(|latest| *end > latest) {
                    self.latest_meter_reading_end = Some(*end);
                }
            },
        }
    }

    /// Globally unique identifier.
    #[must_use]
    pub const fn permission_id(&self) -> &PermissionId {
        &self.permission_id
    }

    /// Owning customer session.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Reference to the requested data contract.
    #[must_use]
    pub fn data_need_id(&self) -> &str {
        &self.data_need_id
    }

    /// Current lifecycle status.
    #[must_use]
    pub const fn status(&self) -> PermissionProcessStatus {
        self.status
    }

    /// When the creation event was committed.
    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// When the status last changed.
    #[must_use]
    pub const fn status_changed(&self) -> DateTime<Utc> {
        self.status_changed
    }

    /// Window as requested by the customer.
    #[must_use]
    pub const fn requested_window(&self) -> &RequestedWindow {
        &self.requested_window
    }

    /// Window resolved during validation; `None` before validation.
    #[must_use]
    pub const fn window(&self) -> Option<ValidityWindow> {
        self.window
    }

    /// First day covered, once validated.
    #[must_use]
    pub fn start(&self) -> Option<NaiveDate> {
        self.window.map(|window| window.start)
    }

    /// Last day covered, once validated.
    #[must_use]
    pub fn end(&self) -> Option<NaiveDate> {
        self.window.map(|window| window.end)
    }

    /// Owning authority, country and connector.
    #[must_use]
    pub const fn data_source(&self) -> &DataSourceInformation {
        &self.data_source
    }

    /// Metering point the request covers, if the connector uses one.
    #[must_use]
    pub fn metering_point(&self) -> Option<&str> {
        self.metering_point.as_deref()
    }

    /// Requested data resolution.
    #[must_use]
    pub const fn granularity(&self) -> Option<Granularity> {
        self.granularity
    }

    /// Connector-specific extension field.
    #[must_use]
    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }

    /// All connector-specific extension fields.
    #[must_use]
    pub const fn extensions(&self) -> &BTreeMap<String, String> {
        &self.extensions
    }

    /// Correlation id handed out by the permission administrator.
    #[must_use]
    pub fn external_reference(&self) -> Option<&str> {
        self.external_reference.as_deref()
    }

    /// End of the latest metering data delivered so far.
    #[must_use]
    pub const fn latest_meter_reading_end(&self) -> Option<NaiveDate> {
        self.latest_meter_reading_end
    }

    /// Validation errors recorded when the request became `MALFORMED`.
    #[must_use]
    pub fn errors(&self) -> &[crate::error::AttributeError] {
        &self.errors
    }

    /// Cause of the most recent failure fact.
    #[must_use]
    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// How often submission to the permission administrator failed.
    #[must_use]
    pub const fn send_failures(&self) -> u32 {
        self.send_failures
    }

    /// How often external termination failed.
    #[must_use]
    pub const fn termination_failures(&self) -> u32 {
        self.termination_failures
    }

    /// Number of events folded into this aggregate.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Whether every day of the validity window has been delivered.
    #[must_use]
    pub fn is_fully_delivered(&self) -> bool {
        match (self.end(), self.latest_meter_reading_end) {
            (Some(end), Some(latest)) => latest >= end,
            _ => false,
        }
    }

    /// Part of the validity window not delivered yet.
    ///
    /// Starts the day after the latest delivered reading. `None` once the
    /// whole window arrived or before a window was resolved.
    #[must_use]
    pub fn outstanding_window(&self) -> Option<ValidityWindow> {
        let window = self.window?;
        let start = match self.latest_meter_reading_end {
            Some(latest) => latest.checked_add_days(Days::new(1))?.max(window.start),
            None => window.start,
        };
        (start <= window.end).then_some(ValidityWindow { start, end: window.end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, PermissionEvent};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }

    fn at() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    fn created(pid: &str) -> PermissionEvent {
        PermissionEvent::new(
            PermissionId::new(pid),
            EventPayload::Created {
                connection_id: "cid".into(),
                data_need_id: "dnid".into(),
                data_source: DataSourceInformation {
                    country_code: "AT".into(),
                    region_connector_id: "at-eda".into(),
                    permission_administrator_id: "pa".into(),
                    meter_data_administrator_id: "mda".into(),
                },
                requested_window: RequestedWindow::Absolute {
                    start: date(2025, 1, 1),
                    end: date(2025, 1, 31),
                },
                metering_point: Some("AT0001".into()),
                granularity: None,
                extensions: BTreeMap::new(),
            },
            at(),
        )
    }

    #[test]
    fn relative_windows_resolve_against_today() {
        let window = RequestedWindow::Relative {
            start_offset_days: 1,
            end_offset_days: 30,
        }
        .resolve(date(2025, 1, 31));
        assert_eq!(window.start, date(2025, 2, 1));
        assert_eq!(window.end, date(2025, 3, 2));
    }

    #[test]
    fn fold_tracks_status_and_payload_facts() {
        let pid = PermissionId::new("pid");
        let events = vec![
            created("pid"),
            PermissionEvent::new(
                pid.clone(),
                EventPayload::Validated {
                    window: ValidityWindow {
                        start: date(2025, 1, 1),
                        end: date(2025, 1, 31),
                    },
                    granularity: Some(Granularity::PT15M),
                },
                at(),
            ),
            PermissionEvent::new(
                pid.clone(),
                EventPayload::UnableToSend {
                    cause: "rate limited".into(),
                    caller_fault: false,
                },
                at(),
            ),
        ];

        let request = PermissionRequest::from_events(&events).ok();
        let request = request.as_ref();
        assert_eq!(request.map(PermissionRequest::status), Some(PermissionProcessStatus::UnableToSend));
        assert_eq!(request.and_then(PermissionRequest::granularity), Some(Granularity::PT15M));
        assert_eq!(request.map(PermissionRequest::send_failures), Some(1));
        assert_eq!(request.map(PermissionRequest::version), Some(Version::new(3)));
    }

    #[test]
    fn data_received_only_moves_latest_end_forward() {
        let pid = PermissionId::new("pid");
        let mut request = PermissionRequest::from_creation(&created("pid"));
        if let Some(request) = request.as_mut() {
            for end in [date(2025, 1, 10), date(2025, 1, 5)] {
                request.apply(&PermissionEvent::new(
                    pid.clone(),
                    EventPayload::DataReceived {
                        start: date(2025, 1, 1),
                        end,
                    },
                    at(),
                ));
            }
        }
        assert_eq!(
            request.and_then(|r| r.latest_meter_reading_end()),
            Some(date(2025, 1, 10))
        );
    }

    #[test]
    fn outstanding_window_starts_after_the_latest_reading() {
        let pid = PermissionId::new("pid");
        let window = ValidityWindow {
            start: date(2025, 1, 1),
            end: date(2025, 1, 31),
        };
        let mut request = PermissionRequest::from_creation(&created("pid"));
        assert_eq!(request.as_ref().and_then(PermissionRequest::outstanding_window), None);

        let deliveries = [
            EventPayload::Validated {
                window,
                granularity: None,
            },
            EventPayload::DataReceived {
                start: date(2025, 1, 1),
                end: date(2025, 1, 10),
            },
        ];
        if let Some(request) = request.as_mut() {
            for payload in deliveries {
                request.apply(&PermissionEvent::new(pid.clone(), payload, at()));
            }
        }
        assert_eq!(
            request.as_ref().and_then(PermissionRequest::outstanding_window),
            Some(ValidityWindow {
                start: date(2025, 1, 11),
                end: date(2025, 1, 31),
            })
        );

        if let Some(request) = request.as_mut() {
            request.apply(&PermissionEvent::new(
                pid,
                EventPayload::DataReceived {
                    start: date(2025, 1, 11),
                    end: date(2025, 1, 31),
                },
                at(),
            ));
        }
        assert_eq!(request.as_ref().and_then(PermissionRequest::outstanding_window), None);
        assert!(request.is_some_and(|r| r.is_fully_delivered()));
    }

    #[test]
    fn replay_rejects_foreign_events() {
        let events = vec![created("a"), created("b")];
        assert_eq!(
            PermissionRequest::from_events(&events),
            Err(ReplayError::ForeignEvent {
                expected: PermissionId::new("a"),
                found: PermissionId::new("b"),
            })
        );
    }

    #[test]
    fn replay_requires_creation_first() {
        let events = vec![PermissionEvent::new(
            PermissionId::new("pid"),
            EventPayload::TimedOut,
            at(),
        )];
        assert_eq!(
            PermissionRequest::from_events(&events),
            Err(ReplayError::MissingCreation(PermissionId::new("pid")))
        );
        assert_eq!(
            PermissionRequest::from_events(std::iter::empty()),
            Err(ReplayError::Empty)
        );
    }
}
