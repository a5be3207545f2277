use crate::config::ValidationConfig;
use crate::event::RawEvent;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use thiserror::Error;

/// Lowest and highest wire value for an exhibition site
pub const SITE_RANGE: (i64, i64) = (0, 5);
/// Lowest and highest wire value for `val`; -1 marks an incident
pub const VAL_RANGE: (i64, i64) = (-1, 4);
/// Wire value of `val` that marks an incident
pub const INCIDENT_VAL: i64 = -1;
/// Lowest and highest wire value for an incident type
pub const TYPE_RANGE: (i64, i64) = (0, 1);

/// Why an event was rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("field '{0}' is null")]
    NullField(String),

    #[error("field '{0}' is missing")]
    MissingField(&'static str),

    #[error("timestamp '{0}' is not an ISO-8601 timestamp with an offset")]
    InvalidTimestamp(String),

    #[error("timestamp {at} is in the future (now {now})")]
    FutureTimestamp {
        at: DateTime<FixedOffset>,
        now: DateTime<Utc>,
    },

    #[error("time of day {time} is outside opening hours {opening}-{closing}")]
    OutsideOperatingHours {
        time: NaiveTime,
        opening: NaiveTime,
        closing: NaiveTime,
    },

    #[error("field '{0}' is not an integer")]
    NotAnInteger(&'static str),

    #[error("field '{field}' value {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

/// What a valid event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A visitor pressed a rating button
    Review { rating: i64 },
    /// A visitor pressed an assistance or emergency button
    Incident { incident_type: i64 },
}

/// An event that passed every check, with its fields parsed
#[derive(Debug, Clone, PartialEq)]
pub struct ValidEvent {
    pub at: DateTime<FixedOffset>,
    pub site: i64,
    pub kind: EventKind,
}

/// Checks raw kiosk events against the museum's business rules
///
/// Rules, in the order they are applied:
/// - no field may be null
/// - `at`, `site` and `val` must be present, and `type` too when `val` is -1
/// - `at` must carry an offset, must not be ahead of the clock by more than
///   the configured tolerance, and must fall inside opening hours
/// - `site`, `val` and `type` must be integers inside their ranges
#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// True when the event would be accepted right now
    pub fn validate(&self, raw: &RawEvent) -> bool {
        self.check(raw, Utc::now()).is_ok()
    }

    /// Check an event against the rules, using `now` as the current time
    pub fn check(&self, raw: &RawEvent, now: DateTime<Utc>) -> Result<ValidEvent, Rejection> {
        if let Some(field) = raw.first_null_field() {
            return Err(Rejection::NullField(field.to_string()));
        }

        for field in [RawEvent::AT, RawEvent::SITE, RawEvent::VAL] {
            if !raw.contains(field) {
                return Err(Rejection::MissingField(field));
            }
        }

        if raw.integer(RawEvent::VAL) == Some(INCIDENT_VAL) && !raw.contains(RawEvent::TYPE) {
            return Err(Rejection::MissingField(RawEvent::TYPE));
        }

        let at = self.check_timestamp(raw, now)?;

        let site = ranged(raw, RawEvent::SITE, SITE_RANGE)?;
        let val = ranged(raw, RawEvent::VAL, VAL_RANGE)?;

        let kind = if val == INCIDENT_VAL {
            EventKind::Incident {
                incident_type: ranged(raw, RawEvent::TYPE, TYPE_RANGE)?,
            }
        } else {
            EventKind::Review { rating: val }
        };

        Ok(ValidEvent { at, site, kind })
    }

    fn check_timestamp(
        &self,
        raw: &RawEvent,
        now: DateTime<Utc>,
    ) -> Result<DateTime<FixedOffset>, Rejection> {
        let value = raw.get(RawEvent::AT);
        let text = value.and_then(|v| v.as_str()).ok_or_else(|| {
            Rejection::InvalidTimestamp(value.map(|v| v.to_string()).unwrap_or_default())
        })?;

        let at = parse_timestamp(text.trim())
            .ok_or_else(|| Rejection::InvalidTimestamp(text.to_string()))?;

        // A tolerance past chrono's range accepts every timestamp
        let latest = i64::try_from(self.config.future_tolerance_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|tolerance| now.checked_add_signed(tolerance));
        if matches!(latest, Some(latest) if at.with_timezone(&Utc) > latest) {
            return Err(Rejection::FutureTimestamp { at, now });
        }

        // Opening hours are wall-clock hours in the offset the kiosk reported
        let time = at.time();
        if time < self.config.opening_time || time > self.config.closing_time {
            return Err(Rejection::OutsideOperatingHours {
                time,
                opening: self.config.opening_time,
                closing: self.config.closing_time,
            });
        }

        Ok(at)
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

/// RFC 3339, or ISO-8601 with a space between date and time
fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .ok()
}

fn ranged(raw: &RawEvent, field: &'static str, (min, max): (i64, i64)) -> Result<i64, Rejection> {
    let value = raw
        .integer(field)
        .ok_or(Rejection::NotAnInteger(field))?;

    if value < min || value > max {
        return Err(Rejection::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn event(value: Value) -> RawEvent {
        match value {
            Value::Object(fields) => RawEvent::from(fields),
            other => panic!("not an object: {}", other),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn late_evening() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap()
    }

    fn review_at(at: &str) -> RawEvent {
        event(json!({"at": at, "site": 1, "val": 2}))
    }

    #[test]
    fn test_valid_review() {
        let validator = Validator::default();
        let raw = event(json!({"at": "2024-06-01T12:00:00+00:00", "site": "2", "val": "3"}));

        let valid = validator.check(&raw, noon()).unwrap();
        assert_eq!(valid.site, 2);
        assert_eq!(valid.kind, EventKind::Review { rating: 3 });
    }

    #[test]
    fn test_valid_incident() {
        let validator = Validator::default();
        let raw = event(json!({
            "at": "2024-06-01T12:00:00+00:00", "site": "0", "val": "-1", "type": "1"
        }));

        let valid = validator.check(&raw, noon()).unwrap();
        assert_eq!(valid.site, 0);
        assert_eq!(valid.kind, EventKind::Incident { incident_type: 1 });
    }

    #[test]
    fn test_missing_required_fields() {
        let validator = Validator::default();

        for field in ["at", "site", "val"] {
            let mut body = json!({"at": "2024-06-01T12:00:00+00:00", "site": 1, "val": 2});
            body.as_object_mut().unwrap().remove(field);

            assert_eq!(
                validator.check(&event(body), noon()),
                Err(Rejection::MissingField(match field {
                    "at" => RawEvent::AT,
                    "site" => RawEvent::SITE,
                    _ => RawEvent::VAL,
                }))
            );
        }
    }

    #[test]
    fn test_null_anywhere_rejects() {
        let validator = Validator::default();

        let raw = event(json!({"at": "2024-06-01T12:00:00+00:00", "site": null, "val": 2}));
        assert_eq!(
            validator.check(&raw, noon()),
            Err(Rejection::NullField("site".to_string()))
        );

        let raw = event(json!({
            "at": "2024-06-01T12:00:00+00:00", "site": 1, "val": 2, "type": null
        }));
        assert!(validator.check(&raw, noon()).is_err());
    }

    #[test]
    fn test_incident_requires_type() {
        let validator = Validator::default();

        for val in [json!(-1), json!("-1")] {
            let raw = event(json!({"at": "2024-06-01T12:00:00+00:00", "site": 1, "val": val}));
            assert_eq!(
                validator.check(&raw, noon()),
                Err(Rejection::MissingField(RawEvent::TYPE))
            );
        }
    }

    #[test]
    fn test_incident_type_range() {
        let validator = Validator::default();

        for incident_type in [json!(2), json!(-1), json!("x")] {
            let raw = event(json!({
                "at": "2024-06-01T12:00:00+00:00", "site": 1, "val": -1, "type": incident_type
            }));
            assert!(validator.check(&raw, noon()).is_err());
        }
    }

    #[test]
    fn test_site_and_val_ranges() {
        let validator = Validator::default();

        for site in [-1, 6, 9] {
            let raw = event(json!({"at": "2024-06-01T12:00:00+00:00", "site": site, "val": 2}));
            assert!(matches!(
                validator.check(&raw, noon()),
                Err(Rejection::OutOfRange { field: "site", .. })
            ));
        }

        for val in [-2, 5] {
            let raw = event(json!({"at": "2024-06-01T12:00:00+00:00", "site": 1, "val": val}));
            assert!(matches!(
                validator.check(&raw, noon()),
                Err(Rejection::OutOfRange { field: "val", .. })
            ));
        }

        for site in 0..=5 {
            for val in 0..=4 {
                let raw =
                    event(json!({"at": "2024-06-01T12:00:00+00:00", "site": site, "val": val}));
                assert!(validator.check(&raw, noon()).is_ok());
            }
        }
    }

    #[test]
    fn test_non_numeric_values_are_rejected() {
        let validator = Validator::default();
        let raw = event(json!({"at": "2024-06-01T12:00:00+00:00", "site": "two", "val": 2}));

        assert_eq!(
            validator.check(&raw, noon()),
            Err(Rejection::NotAnInteger("site"))
        );
    }

    #[test]
    fn test_timestamp_parsing() {
        let validator = Validator::default();

        assert!(validator.check(&review_at("not a date"), noon()).is_err());
        assert!(matches!(
            validator.check(&review_at("2024-06-01T12:00:00"), noon()),
            Err(Rejection::InvalidTimestamp(_))
        ));
        assert!(validator.check(&review_at("2024-06-01T11:00:00.123456Z"), noon()).is_ok());
        assert!(validator.check(&review_at("2024-06-01 11:00:00+00:00"), noon()).is_ok());

        let raw = event(json!({"at": 1717243200, "site": 1, "val": 2}));
        assert!(matches!(
            validator.check(&raw, noon()),
            Err(Rejection::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_operating_hours_boundaries() {
        let validator = Validator::default();

        assert!(validator.check(&review_at("2024-06-01T08:45:00+00:00"), late_evening()).is_ok());
        assert!(validator.check(&review_at("2024-06-01T08:44:59+00:00"), late_evening()).is_err());
        assert!(validator.check(&review_at("2024-06-01T18:15:00+00:00"), late_evening()).is_ok());
        assert!(matches!(
            validator.check(&review_at("2024-06-01T18:15:01+00:00"), late_evening()),
            Err(Rejection::OutsideOperatingHours { .. })
        ));
    }

    #[test]
    fn test_operating_hours_use_reported_offset() {
        let validator = Validator::default();

        // 09:00 in London summer time is 08:00 UTC
        assert!(validator.check(&review_at("2024-06-01T09:00:00+01:00"), noon()).is_ok());
        // 08:30 local is before opening even though it is 09:30 UTC
        assert!(validator.check(&review_at("2024-06-01T08:30:00-01:00"), noon()).is_err());
    }

    #[test]
    fn test_future_timestamps() {
        let validator = Validator::default();
        let now = noon();

        assert!(validator.check(&review_at("2024-06-01T12:00:00.800+00:00"), now).is_ok());
        assert!(validator.check(&review_at("2024-06-01T12:00:00.900+00:00"), now).is_ok());
        assert!(matches!(
            validator.check(&review_at("2024-06-01T12:00:01+00:00"), now),
            Err(Rejection::FutureTimestamp { .. })
        ));
    }

    #[test]
    fn test_future_tolerance_is_configurable() {
        let validator = Validator::new(ValidationConfig {
            future_tolerance_ms: 5_000,
            ..Default::default()
        });

        assert!(validator.check(&review_at("2024-06-01T12:00:04+00:00"), noon()).is_ok());
        assert!(validator.check(&review_at("2024-06-01T12:00:06+00:00"), noon()).is_err());
    }

    #[test]
    fn test_huge_future_tolerance_does_not_overflow() {
        for future_tolerance_ms in [i64::MAX as u64, u64::MAX] {
            let validator = Validator::new(ValidationConfig {
                future_tolerance_ms,
                ..Default::default()
            });

            assert!(validator.check(&review_at("2999-06-01T12:00:00+00:00"), noon()).is_ok());
        }
    }

    #[test]
    fn test_validate_uses_current_clock() {
        let validator = Validator::default();
        assert!(!validator.validate(&review_at("2999-06-01T12:00:00+00:00")));
        assert!(!validator.validate(&event(json!({"site": 1, "val": 2}))));
    }
}
