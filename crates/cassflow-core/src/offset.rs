//! Replication offsets.
//!
//! Progress is tracked per `(table, keyspace, partition, destination)` as a
//! commit-log position plus the timestamp of the last replicated event.
//! Positions order lexicographically by `(file, position)`; an offset never
//! moves backwards.

use crate::error::{ModelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Destination warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Destination {
    Postgres,
    Clickhouse,
    Timescaledb,
}

impl Destination {
    pub const ALL: [Destination; 3] = [
        Destination::Postgres,
        Destination::Clickhouse,
        Destination::Timescaledb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "POSTGRES",
            Self::Clickhouse => "CLICKHOUSE",
            Self::Timescaledb => "TIMESCALEDB",
        }
    }

    /// Lowercase form used in metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Clickhouse => "clickhouse",
            Self::Timescaledb => "timescaledb",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resumption cursor: commit-log file plus the byte position after the
/// last consumed event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub file: String,
    pub position: u64,
}

impl LogPosition {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Self {
            file: file.into(),
            position,
        }
    }
}

impl PartialOrd for LogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        // Commit-log file names embed a monotone segment id, so name order
        // is replay order.
        self.file
            .cmp(&other.file)
            .then(self.position.cmp(&other.position))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

/// Identity of one offset row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetKey {
    pub table: String,
    pub keyspace: String,
    pub partition_id: i64,
    pub destination: Destination,
}

impl OffsetKey {
    pub fn new(
        table: impl Into<String>,
        keyspace: impl Into<String>,
        partition_id: i64,
        destination: Destination,
    ) -> Self {
        Self {
            table: table.into(),
            keyspace: keyspace.into(),
            partition_id,
            destination,
        }
    }
}

impl fmt::Display for OffsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}:partition_{}:{}",
            self.keyspace, self.table, self.partition_id, self.destination
        )
    }
}

/// Committed progress for one offset key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationOffset {
    pub offset_id: Uuid,
    pub key: OffsetKey,
    pub log: LogPosition,
    pub last_event_timestamp_micros: i64,
    pub last_committed_at: DateTime<Utc>,
    pub events_replicated_count: u64,
}

impl ReplicationOffset {
    pub fn create(
        key: OffsetKey,
        log: LogPosition,
        last_event_timestamp_micros: i64,
        events_replicated_count: u64,
    ) -> Result<Self> {
        if last_event_timestamp_micros < 0 {
            return Err(ModelError::offset(
                "last_event_timestamp_micros must be non-negative",
            ));
        }
        Ok(Self {
            offset_id: Uuid::new_v4(),
            key,
            log,
            last_event_timestamp_micros,
            last_committed_at: Utc::now(),
            events_replicated_count,
        })
    }

    /// A new offset advanced past this one. Fails if the position or the
    /// event timestamp would move backwards.
    pub fn advanced(
        &self,
        log: LogPosition,
        last_event_timestamp_micros: i64,
        delta: u64,
    ) -> Result<Self> {
        if log <= self.log {
            return Err(ModelError::offset(format!(
                "position must advance: {} is not past {}",
                log, self.log
            )));
        }
        if last_event_timestamp_micros < self.last_event_timestamp_micros {
            return Err(ModelError::offset(
                "event timestamps must be monotonically non-decreasing",
            ));
        }
        Ok(Self {
            offset_id: self.offset_id,
            key: self.key.clone(),
            log,
            last_event_timestamp_micros,
            last_committed_at: Utc::now(),
            events_replicated_count: self.events_replicated_count + delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> OffsetKey {
        OffsetKey::new("users", "ecommerce", 42, Destination::Postgres)
    }

    #[test]
    fn test_position_ordering_lexicographic() {
        let a = LogPosition::new("CommitLog-7-100.log", 500);
        let b = LogPosition::new("CommitLog-7-100.log", 600);
        let c = LogPosition::new("CommitLog-7-101.log", 0);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn test_create_rejects_negative_timestamp() {
        assert!(
            ReplicationOffset::create(key(), LogPosition::new("CommitLog-7-1.log", 0), -1, 0)
                .is_err()
        );
    }

    #[test]
    fn test_advanced_moves_forward() {
        let offset = ReplicationOffset::create(
            key(),
            LogPosition::new("CommitLog-7-1.log", 100),
            1_000,
            10,
        )
        .unwrap();

        let next = offset
            .advanced(LogPosition::new("CommitLog-7-1.log", 200), 2_000, 5)
            .unwrap();
        assert_eq!(next.offset_id, offset.offset_id);
        assert_eq!(next.events_replicated_count, 15);
        assert_eq!(next.log.position, 200);
    }

    #[test]
    fn test_advanced_rejects_stale_position() {
        let offset = ReplicationOffset::create(
            key(),
            LogPosition::new("CommitLog-7-1.log", 100),
            1_000,
            10,
        )
        .unwrap();

        assert!(offset
            .advanced(LogPosition::new("CommitLog-7-1.log", 100), 2_000, 1)
            .is_err());
        assert!(offset
            .advanced(LogPosition::new("CommitLog-7-1.log", 50), 2_000, 1)
            .is_err());
    }

    #[test]
    fn test_advanced_rejects_timestamp_regression() {
        let offset = ReplicationOffset::create(
            key(),
            LogPosition::new("CommitLog-7-1.log", 100),
            1_000,
            10,
        )
        .unwrap();

        assert!(offset
            .advanced(LogPosition::new("CommitLog-7-1.log", 200), 500, 1)
            .is_err());
    }

    #[test]
    fn test_destination_labels() {
        assert_eq!(Destination::Postgres.as_str(), "POSTGRES");
        assert_eq!(Destination::Clickhouse.label(), "clickhouse");
        let json = serde_json::to_string(&Destination::Timescaledb).unwrap();
        assert_eq!(json, "\"TIMESCALEDB\"");
    }
}
