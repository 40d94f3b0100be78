//! Dead-letter records.
//!
//! One record wraps one event that either exhausted its retries or was
//! classified terminal for a destination. Field names follow the JSONL
//! layout the DLQ files carry on disk.

use crate::event::ChangeEvent;
use crate::offset::Destination;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event the pipeline gave up on, with full failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEvent {
    pub dlq_id: Uuid,
    pub original_event: ChangeEvent,
    pub destination: Destination,
    pub error_category: String,
    pub error_message: String,
    pub retry_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub dlq_written_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn new(
        event: ChangeEvent,
        destination: Destination,
        error_category: impl Into<String>,
        error_message: impl Into<String>,
        retry_count: u32,
        first_failure_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dlq_id: Uuid::new_v4(),
            original_event: event,
            destination,
            error_category: error_category.into(),
            error_message: error_message.into(),
            retry_count,
            first_failure_at,
            dlq_written_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::value::{Column, CqlType, CqlValue, Row};

    #[test]
    fn test_jsonl_field_names() {
        let event = ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            Row::from_columns(vec![Column::new(
                "user_id",
                CqlType::Uuid,
                CqlValue::Uuid(Uuid::nil()),
            )]),
            Row::new(),
            Row::from_columns(vec![Column::new(
                "age",
                CqlType::Int,
                CqlValue::Int(30),
            )]),
            1_700_000_000_000_000,
            None,
        )
        .unwrap();

        let record = DeadLetterEvent::new(
            event,
            Destination::Postgres,
            "SchemaIncompatible",
            "unsupported type tuple for column prefs",
            0,
            Utc::now(),
        );

        let json = serde_json::to_value(&record).unwrap();
        for field in [
            "dlqId",
            "originalEvent",
            "destination",
            "errorCategory",
            "errorMessage",
            "retryCount",
            "firstFailureAt",
            "dlqWrittenAt",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }

        let back: DeadLetterEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
