//! Pluggable validators run once, when a request leaves `CREATED`.
//!
//! Each [`Validator`] inspects the request together with its resolved
//! validity window and reports zero or more [`AttributeError`]s. A
//! [`ValidatorSet`] runs every validator and concatenates the errors in
//! registration order; an empty result means the request is valid.

use crate::error::AttributeError;
use crate::request::{PermissionRequest, ValidityWindow};
use chrono::{Months, NaiveDate};
use std::fmt;
use std::sync::Arc;

/// Attribute name of the window start.
pub const START: &str = "start";
/// Attribute name of the window end.
pub const END: &str = "end";

/// Facts a validator may depend on besides the request itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ValidationContext {
    /// The validation date; relative windows were resolved against it.
    pub today: NaiveDate,
}

/// A single validation rule.
pub trait Validator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Check `request`, whose requested window resolved to `window`.
    fn validate(
        &self,
        request: &PermissionRequest,
        window: &ValidityWindow,
        context: &ValidationContext,
    ) -> Vec<AttributeError>;
}

/// Ordered collection of validators.
#[derive(Clone, Default)]
pub struct ValidatorSet {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorSet {
    /// An empty set; every request passes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The validators every connector shares: retention, ordering and
    /// past-or-future checks.
    #[must_use]
    pub fn standard(retention_months: u32) -> Self {
        Self::new()
            .with(RetentionWindowValidator::new(retention_months))
            .with(StartBeforeEndValidator)
            .with(PastOrFutureValidator)
    }

    /// Append a validator.
    #[must_use]
    pub fn with(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    /// Append a shared validator.
    #[must_use]
    pub fn with_shared(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Number of registered validators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether no validator is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run every validator and collect all errors.
    #[must_use]
    pub fn validate(
        &self,
        request: &PermissionRequest,
        window: &ValidityWindow,
        context: &ValidationContext,
    ) -> Vec<AttributeError> {
        self.validators
            .iter()
            .flat_map(|validator| {
                let errors = validator.validate(request, window, context);
                if !errors.is_empty() {
                    tracing::debug!(
                        permission_id = %request.permission_id(),
                        validator = validator.name(),
                        errors = errors.len(),
                        "Validator rejected permission request"
                    );
                }
                errors
            })
            .collect()
    }
}

impl fmt::Debug for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.validators.iter().map(|v| v.name()))
            .finish()
    }
}

/// The window must not start before the region's data retention limit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetentionWindowValidator {
    retention_months: u32,
}

impl RetentionWindowValidator {
    /// Data older than `retention_months` before today is no longer available.
    #[must_use]
    pub const fn new(retention_months: u32) -> Self {
        Self { retention_months }
    }
}

impl Validator for RetentionWindowValidator {
    fn name(&self) -> &'static str {
        "retention-window"
    }

    fn validate(
        &self,
        _request: &PermissionRequest,
        window: &ValidityWindow,
        context: &ValidationContext,
    ) -> Vec<AttributeError> {
        let earliest = context
            .today
            .checked_sub_months(Months::new(self.retention_months))
            .unwrap_or(NaiveDate::MIN);
        if window.start < earliest {
            vec![AttributeError::new(
                START,
                format!(
                    "must not be older than {} months (earliest {earliest})",
                    self.retention_months
                ),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Start must not be after end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StartBeforeEndValidator;

impl Validator for StartBeforeEndValidator {
    fn name(&self) -> &'static str {
        "start-before-end"
    }

    fn validate(
        &self,
        _request: &PermissionRequest,
        window: &ValidityWindow,
        _context: &ValidationContext,
    ) -> Vec<AttributeError> {
        if window.start > window.end {
            vec![AttributeError::new(START, "must not be after end")]
        } else {
            Vec::new()
        }
    }
}

/// The window lies completely in the past or starts today or later.
///
/// Historical and future data are fetched through different channels, so a
/// window that straddles today cannot be served.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PastOrFutureValidator;

impl Validator for PastOrFutureValidator {
    fn name(&self) -> &'static str {
        "past-or-future"
    }

    fn validate(
        &self,
        _request: &PermissionRequest,
        window: &ValidityWindow,
        context: &ValidationContext,
    ) -> Vec<AttributeError> {
        let in_past = window.end < context.today;
        let in_future = window.start >= context.today;
        if in_past || in_future {
            Vec::new()
        } else {
            vec![AttributeError::new(
                START,
                "window must lie completely in the past or completely in the future",
            )]
        }
    }
}

/// The window must not end further in the future than the region allows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MaxHorizonValidator {
    horizon_months: u32,
}

impl MaxHorizonValidator {
    /// End may be at most `horizon_months` after today.
    #[must_use]
    pub const fn new(horizon_months: u32) -> Self {
        Self { horizon_months }
    }
}

impl Validator for MaxHorizonValidator {
    fn name(&self) -> &'static str {
        "max-horizon"
    }

    fn validate(
        &self,
        _request: &PermissionRequest,
        window: &ValidityWindow,
        context: &ValidationContext,
    ) -> Vec<AttributeError> {
        let latest = context
            .today
            .checked_add_months(Months::new(self.horizon_months))
            .unwrap_or(NaiveDate::MAX);
        if window.end > latest {
            vec![AttributeError::new(
                END,
                format!(
                    "must not be more than {} months in the future (latest {latest})",
                    self.horizon_months
                ),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Which connector-specific field a [`RequiredFieldValidator`] checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequiredField {
    /// The metering point identifier.
    MeteringPoint,
    /// A named extension field.
    Extension(String),
}

/// A connector-specific field must be present and non-blank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequiredFieldValidator {
    field: RequiredField,
}

impl RequiredFieldValidator {
    /// Require the metering point identifier.
    #[must_use]
    pub const fn metering_point() -> Self {
        Self {
            field: RequiredField::MeteringPoint,
        }
    }

    /// Require the extension field `key`.
    #[must_use]
    pub fn extension(key: impl Into<String>) -> Self {
        Self {
            field: RequiredField::Extension(key.into()),
        }
    }
}

impl Validator for RequiredFieldValidator {
    fn name(&self) -> &'static str {
        "required-field"
    }

    fn validate(
        &self,
        request: &PermissionRequest,
        _window: &ValidityWindow,
        _context: &ValidationContext,
    ) -> Vec<AttributeError> {
        let (name, value) = match &self.field {
            RequiredField::MeteringPoint => ("meteringPoint", request.metering_point()),
            RequiredField::Extension(key) => (key.as_str(), request.extension(key)),
        };
        if value.is_some_and(|v| !v.trim().is_empty()) {
            Vec::new()
        } else {
            vec![AttributeError::new(name, "is required")]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, PermissionEvent};
    use crate::request::{DataSourceInformation, RequestedWindow};
    use crate::stream::PermissionId;
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }

    fn request(metering_point: Option<&str>) -> Option<PermissionRequest> {
        PermissionRequest::from_creation(&PermissionEvent::new(
            PermissionId::new("pid"),
            EventPayload::Created {
                connection_id: "cid".into(),
                data_need_id: "dnid".into(),
                data_source: DataSourceInformation {
                    country_code: "DK".into(),
                    region_connector_id: "dk-energinet".into(),
                    permission_administrator_id: "Energinet".into(),
                    meter_data_administrator_id: "Energinet".into(),
                },
                requested_window: RequestedWindow::Absolute {
                    start: date(2025, 1, 1),
                    end: date(2025, 1, 31),
                },
                metering_point: metering_point.map(str::to_string),
                granularity: None,
                extensions: BTreeMap::new(),
            },
            DateTime::<Utc>::default(),
        ))
    }

    fn run(validator: impl Validator + 'static, start: NaiveDate, end: NaiveDate) -> Vec<AttributeError> {
        let context = ValidationContext {
            today: date(2025, 6, 15),
        };
        request(Some("mp"))
            .map(|r| ValidatorSet::new().with(validator).validate(&r, &ValidityWindow { start, end }, &context))
            .unwrap_or_default()
    }

    #[test]
    fn retention_rejects_old_start() {
        let errors = run(RetentionWindowValidator::new(36), date(2022, 6, 14), date(2022, 7, 1));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].name, START);
        assert!(run(RetentionWindowValidator::new(36), date(2022, 6, 15), date(2022, 7, 1)).is_empty());
    }

    #[test]
    fn start_after_end_is_rejected() {
        assert_eq!(
            run(StartBeforeEndValidator, date(2025, 2, 2), date(2025, 2, 1)),
            vec![AttributeError::new(START, "must not be after end")]
        );
        assert!(run(StartBeforeEndValidator, date(2025, 2, 1), date(2025, 2, 1)).is_empty());
    }

    #[test]
    fn window_straddling_today_is_rejected() {
        assert!(run(PastOrFutureValidator, date(2025, 1, 1), date(2025, 6, 14)).is_empty());
        assert!(run(PastOrFutureValidator, date(2025, 6, 15), date(2025, 12, 31)).is_empty());
        assert_eq!(run(PastOrFutureValidator, date(2025, 6, 1), date(2025, 6, 30)).len(), 1);
    }

    #[test]
    fn horizon_limits_end() {
        let errors = run(MaxHorizonValidator::new(12), date(2025, 7, 1), date(2026, 7, 1));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].name, END);
    }

    #[test]
    fn required_metering_point() {
        let context = ValidationContext {
            today: date(2025, 6, 15),
        };
        let window = ValidityWindow {
            start: date(2025, 1, 1),
            end: date(2025, 1, 31),
        };
        let errors = request(None)
            .map(|r| RequiredFieldValidator::metering_point().validate(&r, &window, &context))
            .unwrap_or_default();
        assert_eq!(errors, vec![AttributeError::new("meteringPoint", "is required")]);
    }

    #[test]
    fn set_collects_errors_in_order() {
        let set = ValidatorSet::standard(36).with(MaxHorizonValidator::new(1));
        assert_eq!(set.len(), 4);
        let context = ValidationContext {
            today: date(2025, 6, 15),
        };
        let window = ValidityWindow {
            start: date(2030, 2, 1),
            end: date(2030, 1, 1),
        };
        let names: Vec<String> = request(Some("mp"))
            .map(|r| set.validate(&r, &window, &context))
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![START.to_string(), END.to_string()]);
    }
}
