//! In-memory sink.
//!
//! Implements the full write protocol against process-local state: versioned
//! upserts keyed by primary key (later source timestamp wins), monotone
//! offset rows, injectable failures, and an optional per-batch stall. The
//! pipeline tests drive all three destinations hermetically through this
//! sink.

use crate::error::{ConnectorError, Result};
use crate::sinks::{Sink, SinkCounters, SinkStats, WriteResult};
use async_trait::async_trait;
use cassflow_core::{
    ChangeEvent, CqlValue, Destination, EventKind, OffsetKey, ReplicationOffset, Row,
    SchemaChange,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// A stored destination row: merge version (source timestamp) plus values.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub version: i64,
    pub values: Row,
}

#[derive(Default)]
struct MemoryState {
    /// (keyspace, table) → pk-canonical-bytes → row
    rows: HashMap<(String, String), HashMap<Vec<u8>, StoredRow>>,
    offsets: HashMap<OffsetKey, ReplicationOffset>,
    schema_changes: Vec<SchemaChange>,
    /// Errors to fail the next write_batch calls with, in order.
    failures: Vec<ConnectorError>,
    /// Artificial stall applied to each write, for slow-destination tests.
    write_delay: Option<Duration>,
    connected: bool,
}

/// Test double implementing the full [`Sink`] contract in memory.
pub struct MemorySink {
    destination: Destination,
    state: RwLock<MemoryState>,
    counters: SinkCounters,
}

impl MemorySink {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            state: RwLock::new(MemoryState::default()),
            counters: SinkCounters::new(),
        }
    }

    /// Queue errors for upcoming `write_batch` calls (consumed in order).
    pub async fn fail_next_writes(&self, errors: Vec<ConnectorError>) {
        let mut state = self.state.write().await;
        state.failures = errors;
        state.failures.reverse();
    }

    /// Stall every write by `delay`.
    pub async fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.write().await.write_delay = delay;
    }

    pub async fn row_count(&self, keyspace: &str, table: &str) -> usize {
        self.state
            .read()
            .await
            .rows
            .get(&(keyspace.to_string(), table.to_string()))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub async fn get_row(&self, keyspace: &str, table: &str, pk: &Row) -> Option<StoredRow> {
        self.state
            .read()
            .await
            .rows
            .get(&(keyspace.to_string(), table.to_string()))
            .and_then(|m| m.get(&pk.canonical_bytes()))
            .cloned()
    }

    /// The value of one column of one row, for assertions.
    pub async fn column_value(
        &self,
        keyspace: &str,
        table: &str,
        pk: &Row,
        column: &str,
    ) -> Option<CqlValue> {
        self.get_row(keyspace, table, pk)
            .await
            .and_then(|row| row.values.get(column).map(|c| c.value.clone()))
    }

    pub async fn offset(&self, key: &OffsetKey) -> Option<ReplicationOffset> {
        self.state.read().await.offsets.get(key).cloned()
    }

    pub async fn offsets(&self) -> Vec<ReplicationOffset> {
        self.state.read().await.offsets.values().cloned().collect()
    }

    pub async fn applied_schema_changes(&self) -> Vec<SchemaChange> {
        self.state.read().await.schema_changes.clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn destination(&self) -> Destination {
        self.destination
    }

    async fn connect(&self) -> Result<()> {
        self.state.write().await.connected = true;
        Ok(())
    }

    async fn close(&self) {
        self.state.write().await.connected = false;
    }

    async fn write_batch(
        &self,
        events: &[ChangeEvent],
        offset: &ReplicationOffset,
    ) -> Result<WriteResult> {
        self.counters.batch_started();
        let result = self.write_batch_inner(events, offset).await;
        if result.is_err() {
            self.counters.record_error();
        }
        self.counters.batch_finished();
        result
    }

    async fn apply_schema_change(&self, change: &SchemaChange) -> Result<()> {
        self.state.write().await.schema_changes.push(change.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<Duration> {
        if self.state.read().await.connected {
            Ok(Duration::from_micros(50))
        } else {
            Err(ConnectorError::connection("memory sink not connected"))
        }
    }

    async fn load_offsets(&self) -> Result<Vec<ReplicationOffset>> {
        Ok(self.offsets().await)
    }

    fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }
}

impl MemorySink {
    async fn write_batch_inner(
        &self,
        events: &[ChangeEvent],
        offset: &ReplicationOffset,
    ) -> Result<WriteResult> {
        let delay = { self.state.read().await.write_delay };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        if let Some(error) = state.failures.pop() {
            return Err(error);
        }

        let mut written = 0u64;
        for event in events {
            let table_key = (event.keyspace().to_string(), event.table().to_string());
            let pk: Row = event.primary_key().cloned().collect();
            let pk_bytes = pk.canonical_bytes();
            let rows = state.rows.entry(table_key).or_default();

            match event.kind() {
                EventKind::Delete => {
                    // version check keeps a replayed old delete from
                    // clobbering newer state
                    if rows
                        .get(&pk_bytes)
                        .map_or(true, |r| r.version <= event.timestamp_micros())
                    {
                        rows.remove(&pk_bytes);
                    }
                }
                EventKind::Insert | EventKind::Update => {
                    let candidate_version = event.timestamp_micros();
                    let keep = rows
                        .get(&pk_bytes)
                        .map_or(true, |existing| existing.version <= candidate_version);
                    if keep {
                        let mut values = pk.clone();
                        for cell in event.columns() {
                            values.set(cell.clone());
                        }
                        rows.insert(
                            pk_bytes,
                            StoredRow {
                                version: candidate_version,
                                values,
                            },
                        );
                    }
                }
            }
            written += 1;
        }

        // Offset advances only forward, mirroring the SQL guard clause.
        let stale = state
            .offsets
            .get(&offset.key)
            .is_some_and(|existing| offset.log <= existing.log);
        if !stale {
            state.offsets.insert(offset.key.clone(), offset.clone());
        }

        self.counters.record_written(written);
        Ok(WriteResult::new(written, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassflow_core::{Column, CqlType, LogPosition};
    use uuid::Uuid;

    fn pk(user: u128) -> Row {
        Row::from_columns(vec![Column::new(
            "user_id",
            CqlType::Uuid,
            CqlValue::Uuid(Uuid::from_u128(user)),
        )])
    }

    fn insert(user: u128, email: &str, ts: i64) -> ChangeEvent {
        ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            pk(user),
            Row::new(),
            Row::from_columns(vec![Column::new(
                "email",
                CqlType::Text,
                CqlValue::Text(email.into()),
            )]),
            ts,
            None,
        )
        .unwrap()
    }

    fn offset_at(position: u64, ts: i64) -> ReplicationOffset {
        ReplicationOffset::create(
            OffsetKey::new("users", "ecommerce", 1, Destination::Postgres),
            LogPosition::new("CommitLog-7-1.log", position),
            ts,
            1,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_replay_idempotent() {
        let sink = MemorySink::new(Destination::Postgres);
        sink.connect().await.unwrap();

        let event = insert(1, "a@b.com", 100);
        let offset = offset_at(64, 100);

        sink.write_batch(&[event.clone()], &offset).await.unwrap();
        sink.write_batch(&[event], &offset).await.unwrap();

        assert_eq!(sink.row_count("ecommerce", "users").await, 1);
        let stored = sink.offset(&offset.key).await.unwrap();
        assert_eq!(stored.log.position, 64);
    }

    #[tokio::test]
    async fn test_later_version_wins() {
        let sink = MemorySink::new(Destination::Postgres);
        sink.write_batch(&[insert(1, "new@b.com", 200)], &offset_at(64, 200))
            .await
            .unwrap();
        // replayed older event must not overwrite newer state
        sink.write_batch(&[insert(1, "old@b.com", 100)], &offset_at(32, 100))
            .await
            .unwrap();

        assert_eq!(
            sink.column_value("ecommerce", "users", &pk(1), "email")
                .await,
            Some(CqlValue::Text("new@b.com".into()))
        );
    }

    #[tokio::test]
    async fn test_delete_removes_row() {
        let sink = MemorySink::new(Destination::Postgres);
        sink.write_batch(&[insert(1, "a@b.com", 100)], &offset_at(64, 100))
            .await
            .unwrap();

        let delete = ChangeEvent::new(
            EventKind::Delete,
            "ecommerce",
            "users",
            pk(1),
            Row::new(),
            Row::new(),
            200,
            None,
        )
        .unwrap();
        sink.write_batch(&[delete], &offset_at(128, 200))
            .await
            .unwrap();

        assert_eq!(sink.row_count("ecommerce", "users").await, 0);
    }

    #[tokio::test]
    async fn test_injected_failures_consumed_in_order() {
        let sink = MemorySink::new(Destination::Postgres);
        sink.fail_next_writes(vec![
            ConnectorError::timeout("first"),
            ConnectorError::timeout("second"),
        ])
        .await;

        let event = insert(1, "a@b.com", 100);
        let offset = offset_at(64, 100);

        let err = sink.write_batch(&[event.clone()], &offset).await.unwrap_err();
        assert!(err.to_string().contains("first"));
        let err = sink.write_batch(&[event.clone()], &offset).await.unwrap_err();
        assert!(err.to_string().contains("second"));
        assert!(sink.write_batch(&[event], &offset).await.is_ok());
        assert_eq!(sink.stats().errors, 2);
    }

    #[tokio::test]
    async fn test_offset_only_write() {
        let sink = MemorySink::new(Destination::Postgres);
        let offset = offset_at(64, 100);
        sink.write_batch(&[], &offset).await.unwrap();
        assert_eq!(sink.row_count("ecommerce", "users").await, 0);
        assert!(sink.offset(&offset.key).await.is_some());
    }
}
