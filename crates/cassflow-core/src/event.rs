//! Change event representation.
//!
//! One [`ChangeEvent`] records one row mutation read from the source
//! commit-log. Events are immutable once constructed; the masking transform
//! produces a replacement via [`ChangeEvent::with_columns`] and discards the
//! original.

use crate::error::{ModelError, Result};
use crate::value::Row;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tolerated clock skew between the source host and this process when
/// validating capture times.
pub const MAX_CAPTURE_SKEW: chrono::Duration = Duration::seconds(5);

/// Namespace for deterministic event ids (UUIDv5).
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x14, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30,
    0xc8,
]);

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the stable event id from the decode context.
///
/// The same commit-log bytes always yield the same id, which is what makes
/// replayed batches idempotent at the destinations.
pub fn deterministic_event_id(
    commitlog_file: &str,
    partition_key: &Row,
    clustering_key: &Row,
    timestamp_micros: i64,
) -> Uuid {
    let mut buf = Vec::new();
    buf.extend_from_slice(commitlog_file.as_bytes());
    buf.push(0x1f);
    buf.extend_from_slice(&partition_key.canonical_bytes());
    buf.push(0x1f);
    buf.extend_from_slice(&clustering_key.canonical_bytes());
    buf.push(0x1f);
    buf.extend_from_slice(timestamp_micros.to_string().as_bytes());
    Uuid::new_v5(&EVENT_ID_NAMESPACE, &buf)
}

/// A single data modification captured from the source.
///
/// Identity is the stable `event_id`: two events compare equal iff their ids
/// match, regardless of capture time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    event_id: Uuid,
    kind: EventKind,
    keyspace: String,
    table: String,
    partition_key: Row,
    clustering_key: Row,
    columns: Row,
    timestamp_micros: i64,
    ttl_seconds: Option<u32>,
    captured_at: DateTime<Utc>,
}

impl PartialEq for ChangeEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for ChangeEvent {}

impl ChangeEvent {
    /// Construct an event with a caller-supplied stable id.
    ///
    /// Validation enforces the model invariants: non-empty partition key,
    /// positive source timestamp, kind-to-columns coherence, positive TTL,
    /// and a capture time no further in the future than [`MAX_CAPTURE_SKEW`].
    #[allow(clippy::too_many_arguments)]
    pub fn with_event_id(
        event_id: Uuid,
        kind: EventKind,
        keyspace: impl Into<String>,
        table: impl Into<String>,
        partition_key: Row,
        clustering_key: Row,
        columns: Row,
        timestamp_micros: i64,
        ttl_seconds: Option<u32>,
    ) -> Result<Self> {
        if partition_key.is_empty() {
            return Err(ModelError::event("partition key must be non-empty"));
        }
        if timestamp_micros <= 0 {
            return Err(ModelError::event("timestamp_micros must be positive"));
        }
        match kind {
            EventKind::Delete => {
                if !columns.is_empty() {
                    return Err(ModelError::event("DELETE events must not carry columns"));
                }
            }
            EventKind::Insert | EventKind::Update => {
                if columns.is_empty() {
                    return Err(ModelError::event(format!(
                        "columns required for {kind} events"
                    )));
                }
            }
        }
        if let Some(ttl) = ttl_seconds {
            if ttl == 0 {
                return Err(ModelError::event("ttl_seconds must be positive when set"));
            }
        }
        let captured_at = Utc::now();
        Ok(Self {
            event_id,
            kind,
            keyspace: keyspace.into(),
            table: table.into(),
            partition_key,
            clustering_key,
            columns,
            timestamp_micros,
            ttl_seconds,
            captured_at,
        })
    }

    /// Construct an event with a fresh random id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: EventKind,
        keyspace: impl Into<String>,
        table: impl Into<String>,
        partition_key: Row,
        clustering_key: Row,
        columns: Row,
        timestamp_micros: i64,
        ttl_seconds: Option<u32>,
    ) -> Result<Self> {
        Self::with_event_id(
            Uuid::new_v4(),
            kind,
            keyspace,
            table,
            partition_key,
            clustering_key,
            columns,
            timestamp_micros,
            ttl_seconds,
        )
    }

    /// Validate a deserialized event against the same invariants the
    /// constructor enforces (used after round-tripping through the DLQ).
    pub fn validate(&self) -> Result<()> {
        if self.partition_key.is_empty() {
            return Err(ModelError::event("partition key must be non-empty"));
        }
        if self.timestamp_micros <= 0 {
            return Err(ModelError::event("timestamp_micros must be positive"));
        }
        if self.captured_at > Utc::now() + MAX_CAPTURE_SKEW {
            return Err(ModelError::event("captured_at is in the future"));
        }
        Ok(())
    }

    /// Copy-on-transform: a new event identical to this one except for its
    /// column values. Identity (and therefore the stable id) is preserved.
    pub fn with_columns(&self, columns: Row) -> Result<Self> {
        if self.kind != EventKind::Delete && columns.is_empty() {
            return Err(ModelError::event(format!(
                "columns required for {} events",
                self.kind
            )));
        }
        Ok(Self {
            columns,
            ..self.clone()
        })
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn partition_key(&self) -> &Row {
        &self.partition_key
    }

    pub fn clustering_key(&self) -> &Row {
        &self.clustering_key
    }

    pub fn columns(&self) -> &Row {
        &self.columns
    }

    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp_micros
    }

    pub fn ttl_seconds(&self) -> Option<u32> {
        self.ttl_seconds
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Primary-key cells (partition then clustering), the destination upsert key.
    pub fn primary_key(&self) -> impl Iterator<Item = &crate::value::Column> {
        self.partition_key.iter().chain(self.clustering_key.iter())
    }

    /// Stable 64-bit hash of the partition key. Used both as the offset
    /// partition id and to pin events to a worker slot per destination.
    pub fn partition_hash(&self) -> i64 {
        // FNV-1a; stable across processes, unlike the std hasher.
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = OFFSET;
        for byte in self.partition_key.canonical_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
        hash as i64
    }

    /// Deduplication key: table, partition, clustering, source timestamp.
    pub fn event_key(&self) -> String {
        format!(
            "{}.{}:{}:{}:{}",
            self.keyspace,
            self.table,
            String::from_utf8_lossy(&self.partition_key.canonical_bytes()),
            String::from_utf8_lossy(&self.clustering_key.canonical_bytes()),
            self.timestamp_micros
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Column, CqlType, CqlValue};

    fn pk() -> Row {
        Row::from_columns(vec![Column::new(
            "user_id",
            CqlType::Uuid,
            CqlValue::Uuid(Uuid::nil()),
        )])
    }

    fn cols() -> Row {
        Row::from_columns(vec![
            Column::new("email", CqlType::Text, CqlValue::Text("a@b.com".into())),
            Column::new("age", CqlType::Int, CqlValue::Int(30)),
        ])
    }

    #[test]
    fn test_insert_event() {
        let event = ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            pk(),
            Row::new(),
            cols(),
            1_700_000_000_000_000,
            None,
        )
        .unwrap();

        assert_eq!(event.kind(), EventKind::Insert);
        assert_eq!(event.keyspace(), "ecommerce");
        assert_eq!(event.columns().len(), 2);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_delete_with_columns_rejected() {
        let err = ChangeEvent::new(
            EventKind::Delete,
            "ecommerce",
            "users",
            pk(),
            Row::new(),
            cols(),
            1_700_000_000_000_000,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("DELETE"));
    }

    #[test]
    fn test_insert_without_columns_rejected() {
        assert!(ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            pk(),
            Row::new(),
            Row::new(),
            1_700_000_000_000_000,
            None,
        )
        .is_err());
    }

    #[test]
    fn test_empty_partition_key_rejected() {
        assert!(ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            Row::new(),
            Row::new(),
            cols(),
            1_700_000_000_000_000,
            None,
        )
        .is_err());
    }

    #[test]
    fn test_non_positive_timestamp_rejected() {
        for ts in [0, -1] {
            assert!(ChangeEvent::new(
                EventKind::Insert,
                "ecommerce",
                "users",
                pk(),
                Row::new(),
                cols(),
                ts,
                None,
            )
            .is_err());
        }
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            pk(),
            Row::new(),
            cols(),
            1_700_000_000_000_000,
            Some(0),
        )
        .is_err());
    }

    #[test]
    fn test_identity_is_by_id() {
        let id = Uuid::new_v4();
        let a = ChangeEvent::with_event_id(
            id,
            EventKind::Insert,
            "ks",
            "users",
            pk(),
            Row::new(),
            cols(),
            10,
            None,
        )
        .unwrap();
        let b = ChangeEvent::with_event_id(
            id,
            EventKind::Update,
            "ks",
            "users",
            pk(),
            Row::new(),
            cols(),
            20,
            None,
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_deterministic_id_stable() {
        let a = deterministic_event_id("CommitLog-7-1.log", &pk(), &Row::new(), 42);
        let b = deterministic_event_id("CommitLog-7-1.log", &pk(), &Row::new(), 42);
        let c = deterministic_event_id("CommitLog-7-2.log", &pk(), &Row::new(), 42);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_with_columns_preserves_identity() {
        let event = ChangeEvent::new(
            EventKind::Insert,
            "ks",
            "users",
            pk(),
            Row::new(),
            cols(),
            10,
            None,
        )
        .unwrap();
        let masked = event
            .with_columns(Row::from_columns(vec![Column::new(
                "email",
                CqlType::Text,
                CqlValue::Text("masked".into()),
            )]))
            .unwrap();
        assert_eq!(event, masked);
        assert_eq!(
            masked.columns().get("email").unwrap().value,
            CqlValue::Text("masked".into())
        );
    }

    #[test]
    fn test_partition_hash_stable() {
        let a = ChangeEvent::new(
            EventKind::Insert,
            "ks",
            "users",
            pk(),
            Row::new(),
            cols(),
            10,
            None,
        )
        .unwrap();
        let b = ChangeEvent::new(
            EventKind::Insert,
            "ks",
            "users",
            pk(),
            Row::new(),
            cols(),
            20,
            None,
        )
        .unwrap();
        assert_eq!(a.partition_hash(), b.partition_hash());
    }

    #[test]
    fn test_serde_round_trip() {
        let event = ChangeEvent::new(
            EventKind::Insert,
            "ks",
            "users",
            pk(),
            Row::new(),
            cols(),
            10,
            Some(3600),
        )
        .unwrap();
        let json = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert_eq!(back.ttl_seconds(), Some(3600));
        assert_eq!(back.columns(), event.columns());
    }
}
