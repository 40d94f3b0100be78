//! Per-destination event validation.
//!
//! Runs after masking, once per destination copy of each event. Rejections
//! are terminal: the event goes to the DLQ with the validator's reason and
//! is never retried.
//!
//! Rules:
//! - a column whose source type has no destination mapping →
//!   `SchemaIncompatible(unsupported-type)`
//! - a column the schema monitor flagged as incompatibly altered →
//!   `SchemaIncompatible` naming the column; destinations keep the old
//!   column type, so these events cannot be represented
//! - an event partition-key column that the cached schema no longer lists as
//!   a partition key → `SchemaIncompatible(key-drop)`
//! - a column absent from the cached schema (add-column race) → accepted;
//!   the schema-change DDL is applied before the new column's events flush
//! - no cached schema yet → accepted (first observation is in flight)

use crate::error::{ConnectorError, Result};
use crate::mapper::TypeMapper;
use cassflow_cdc::SchemaCache;
use cassflow_core::{ChangeEvent, SchemaSnapshot};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Validates events against the cached source schema and a destination's
/// type mapper.
pub struct EventValidator {
    cache: SchemaCache,
    /// Columns whose type changed in a way destinations cannot follow,
    /// keyed by `(keyspace, table)`. Latched by the orchestrator when an
    /// incompatible schema change arrives; cleared by operator action.
    incompatible: RwLock<HashMap<(String, String), HashSet<String>>>,
}

impl EventValidator {
    pub fn new(cache: SchemaCache) -> Self {
        Self {
            cache,
            incompatible: RwLock::new(HashMap::new()),
        }
    }

    /// Record columns an incompatible schema change affected.
    pub async fn mark_incompatible(
        &self,
        keyspace: &str,
        table: &str,
        columns: impl IntoIterator<Item = String>,
    ) {
        self.incompatible
            .write()
            .await
            .entry((keyspace.to_string(), table.to_string()))
            .or_default()
            .extend(columns);
    }

    /// Clear the incompatibility latch for a table.
    pub async fn clear_incompatible(&self, keyspace: &str, table: &str) {
        self.incompatible
            .write()
            .await
            .remove(&(keyspace.to_string(), table.to_string()));
    }

    pub async fn validate(&self, event: &ChangeEvent, mapper: &TypeMapper) -> Result<()> {
        for cell in event.primary_key().chain(event.columns().iter()) {
            if mapper.map(cell.cql_type).is_none() {
                return Err(ConnectorError::schema_incompatible(
                    &cell.name,
                    format!(
                        "unsupported type {} for destination {}",
                        cell.cql_type,
                        mapper.destination()
                    ),
                ));
            }
        }

        {
            let incompatible = self.incompatible.read().await;
            if let Some(columns) =
                incompatible.get(&(event.keyspace().to_string(), event.table().to_string()))
            {
                for cell in event.primary_key().chain(event.columns().iter()) {
                    if columns.contains(&cell.name) {
                        return Err(ConnectorError::schema_incompatible(
                            &cell.name,
                            "column type changed incompatibly; destination cannot follow",
                        ));
                    }
                }
            }
        }

        let snapshot = {
            self.cache
                .read()
                .await
                .get(&(event.keyspace().to_string(), event.table().to_string()))
                .cloned()
        };
        let Some(snapshot) = snapshot else {
            return Ok(());
        };

        self.check_keys(event, &snapshot)
    }

    fn check_keys(&self, event: &ChangeEvent, snapshot: &SchemaSnapshot) -> Result<()> {
        for cell in event.partition_key() {
            let still_partition_key = snapshot
                .partition_keys()
                .any(|c| c.name == cell.name);
            if !still_partition_key {
                return Err(ConnectorError::schema_incompatible(
                    &cell.name,
                    "column used as partition key was dropped from the schema",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassflow_core::{
        Column, ColumnDef, ColumnKind, CqlType, CqlValue, Destination, EventKind, Row,
    };
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use uuid::Uuid;

    fn cache_with(snapshot: Option<SchemaSnapshot>) -> SchemaCache {
        let mut map = HashMap::new();
        if let Some(s) = snapshot {
            map.insert((s.keyspace.clone(), s.table.clone()), s);
        }
        Arc::new(RwLock::new(map))
    }

    fn users_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new(
            "ecommerce",
            "users",
            1,
            vec![
                ColumnDef::new("user_id", CqlType::Uuid, ColumnKind::PartitionKey),
                ColumnDef::new("email", CqlType::Text, ColumnKind::Regular),
                ColumnDef::new("age", CqlType::Int, ColumnKind::Regular),
            ],
        )
    }

    fn users_event(columns: Vec<Column>) -> ChangeEvent {
        ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            Row::from_columns(vec![Column::new(
                "user_id",
                CqlType::Uuid,
                CqlValue::Uuid(Uuid::from_u128(5)),
            )]),
            Row::new(),
            Row::from_columns(columns),
            1_700_000_000_000_000,
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_event_accepted() {
        let validator = EventValidator::new(cache_with(Some(users_snapshot())));
        let event = users_event(vec![Column::new(
            "email",
            CqlType::Text,
            CqlValue::Text("a@b.com".into()),
        )]);
        for dest in Destination::ALL {
            assert!(validator
                .validate(&event, &TypeMapper::new(dest))
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn test_unsupported_type_rejected_with_column_name() {
        let validator = EventValidator::new(cache_with(Some(users_snapshot())));
        let event = users_event(vec![Column::new(
            "visits",
            CqlType::Counter,
            CqlValue::Counter(3),
        )]);

        let err = validator
            .validate(&event, &TypeMapper::new(Destination::Postgres))
            .await
            .unwrap_err();
        match err {
            ConnectorError::SchemaIncompatible { column, reason } => {
                assert_eq!(column, "visits");
                assert!(reason.contains("unsupported type counter"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_column_accepted_add_race() {
        let validator = EventValidator::new(cache_with(Some(users_snapshot())));
        let event = users_event(vec![
            Column::new("email", CqlType::Text, CqlValue::Text("a@b.com".into())),
            Column::new("city", CqlType::Text, CqlValue::Text("NYC".into())),
        ]);
        assert!(validator
            .validate(&event, &TypeMapper::new(Destination::Postgres))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_key_drop_rejected() {
        // schema where user_id is no longer a partition key
        let snapshot = SchemaSnapshot::new(
            "ecommerce",
            "users",
            2,
            vec![
                ColumnDef::new("tenant_id", CqlType::Uuid, ColumnKind::PartitionKey),
                ColumnDef::new("email", CqlType::Text, ColumnKind::Regular),
            ],
        );
        let validator = EventValidator::new(cache_with(Some(snapshot)));
        let event = users_event(vec![Column::new(
            "email",
            CqlType::Text,
            CqlValue::Text("a@b.com".into()),
        )]);

        let err = validator
            .validate(&event, &TypeMapper::new(Destination::Postgres))
            .await
            .unwrap_err();
        match err {
            ConnectorError::SchemaIncompatible { column, reason } => {
                assert_eq!(column, "user_id");
                assert!(reason.contains("partition key"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_incompatibly_altered_column_rejected() {
        let validator = EventValidator::new(cache_with(Some(users_snapshot())));
        validator
            .mark_incompatible("ecommerce", "users", vec!["age".to_string()])
            .await;

        let event = users_event(vec![
            Column::new("email", CqlType::Text, CqlValue::Text("a@b.com".into())),
            Column::new("age", CqlType::Text, CqlValue::Text("30".into())),
        ]);
        let err = validator
            .validate(&event, &TypeMapper::new(Destination::Postgres))
            .await
            .unwrap_err();
        match err {
            ConnectorError::SchemaIncompatible { column, .. } => assert_eq!(column, "age"),
            other => panic!("unexpected error: {other}"),
        }

        // events not touching the column still flow
        let ok = users_event(vec![Column::new(
            "email",
            CqlType::Text,
            CqlValue::Text("a@b.com".into()),
        )]);
        assert!(validator
            .validate(&ok, &TypeMapper::new(Destination::Postgres))
            .await
            .is_ok());

        validator.clear_incompatible("ecommerce", "users").await;
        let again = users_event(vec![Column::new(
            "age",
            CqlType::Text,
            CqlValue::Text("30".into()),
        )]);
        assert!(validator
            .validate(&again, &TypeMapper::new(Destination::Postgres))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_no_schema_yet_accepted() {
        let validator = EventValidator::new(cache_with(None));
        let event = users_event(vec![Column::new(
            "email",
            CqlType::Text,
            CqlValue::Text("a@b.com".into()),
        )]);
        assert!(validator
            .validate(&event, &TypeMapper::new(Destination::Clickhouse))
            .await
            .is_ok());
    }
}
