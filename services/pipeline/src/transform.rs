//! Turns validated kiosk events into rows for the `review` and `incident` tables.
//!
//! The wire format counts sites, ratings and incident types from zero; the
//! database reference tables count from one. Every id is therefore shifted by
//! one on the way through.

use crate::event::RawEvent;
use crate::validator::{EventKind, Rejection, ValidEvent, Validator};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// A visitor rating for an exhibition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewRecord {
    pub review_at: DateTime<FixedOffset>,
    pub exhibition_id: i32,
    pub rating_id: i32,
}

/// An assistance or emergency request at an exhibition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncidentRecord {
    pub incident_at: DateTime<FixedOffset>,
    pub exhibition_id: i32,
    pub incident_type_id: i32,
}

/// A row ready to be written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Review(ReviewRecord),
    Incident(IncidentRecord),
}

impl Record {
    /// Destination table for this record
    pub fn table(&self) -> &'static str {
        match self {
            Record::Review(_) => "review",
            Record::Incident(_) => "incident",
        }
    }

    pub fn exhibition_id(&self) -> i32 {
        match self {
            Record::Review(review) => review.exhibition_id,
            Record::Incident(incident) => incident.exhibition_id,
        }
    }
}

impl From<ValidEvent> for Record {
    fn from(event: ValidEvent) -> Self {
        let exhibition_id = to_id(event.site);

        match event.kind {
            EventKind::Review { rating } => Record::Review(ReviewRecord {
                review_at: event.at,
                exhibition_id,
                rating_id: to_id(rating),
            }),
            EventKind::Incident { incident_type } => Record::Incident(IncidentRecord {
                incident_at: event.at,
                exhibition_id,
                incident_type_id: to_id(incident_type),
            }),
        }
    }
}

/// Wire values are validated to small ranges before they get here
fn to_id(wire_value: i64) -> i32 {
    (wire_value + 1) as i32
}

/// Validates raw events and maps them to records
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    validator: Validator,
}

impl Transformer {
    pub fn new(validator: Validator) -> Self {
        Self { validator }
    }

    /// Transform a raw event, or `None` if it breaks a rule
    pub fn transform(&self, raw: &RawEvent) -> Option<Record> {
        self.transform_at(raw, Utc::now())
    }

    /// Transform against a fixed clock
    pub fn transform_at(&self, raw: &RawEvent, now: DateTime<Utc>) -> Option<Record> {
        match self.try_transform_at(raw, now) {
            Ok(record) => Some(record),
            Err(rejection) => {
                warn!(reason = %rejection, "Message had incorrect data");
                None
            }
        }
    }

    /// Transform against a fixed clock, keeping the rejection reason
    pub fn try_transform_at(
        &self,
        raw: &RawEvent,
        now: DateTime<Utc>,
    ) -> Result<Record, Rejection> {
        let valid = self.validator.check(raw, now)?;
        let record = Record::from(valid);

        debug!(table = record.table(), "{} data found", record.table());

        Ok(record)
    }
}
