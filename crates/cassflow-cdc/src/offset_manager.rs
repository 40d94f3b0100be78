//! Offset manager.
//!
//! Authoritative in-process view of per-`(table, keyspace, partition,
//! destination)` progress. The durable copy lives in each destination's
//! offsets table and is written inside the destination's own batch protocol;
//! this manager supplies the DML those writes embed and enforces the
//! monotone-advance rule before any write is attempted.
//!
//! `advance` is a no-op ([`Advance::Duplicate`]) when the new position is at
//! or behind the stored one: the batch is a duplicate replay and was already
//! committed.

use crate::error::Result;
use cassflow_core::{LogPosition, OffsetKey, ReplicationOffset};
use tokio::sync::RwLock;
use tracing::debug;

/// Name of the offsets table in every relational destination.
pub const OFFSETS_TABLE: &str = "cdc_offsets";

/// Outcome of an advance attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    /// Progress moved forward; the returned offset is what the sink commits.
    Advanced(ReplicationOffset),
    /// The position was at or behind the stored offset; nothing to write.
    Duplicate,
}

/// Tracks replication progress and hands sinks their offset DML.
#[derive(Default)]
pub struct OffsetManager {
    offsets: RwLock<std::collections::HashMap<OffsetKey, ReplicationOffset>>,
}

impl OffsetManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last committed offset for a key, if any.
    pub async fn read(&self, key: &OffsetKey) -> Option<ReplicationOffset> {
        self.offsets.read().await.get(key).cloned()
    }

    /// Install an offset loaded from a destination at startup.
    pub async fn seed(&self, offset: ReplicationOffset) {
        self.offsets
            .write()
            .await
            .insert(offset.key.clone(), offset);
    }

    /// Compute the offset a successful batch commit will store.
    ///
    /// Creates the offset lazily on first write for the key. The caller
    /// records the result back via [`OffsetManager::commit`] only after the
    /// destination write protocol acknowledged.
    pub async fn advance(
        &self,
        key: &OffsetKey,
        log: LogPosition,
        last_event_timestamp_micros: i64,
        delta: u64,
    ) -> Result<Advance> {
        let offsets = self.offsets.read().await;
        match offsets.get(key) {
            None => {
                drop(offsets);
                let offset =
                    ReplicationOffset::create(key.clone(), log, last_event_timestamp_micros, delta)?;
                Ok(Advance::Advanced(offset))
            }
            Some(stored) if log <= stored.log => {
                debug!(key = %key, position = %log, "duplicate replay, offset unchanged");
                Ok(Advance::Duplicate)
            }
            Some(stored) => {
                // A later position can still carry an older source timestamp
                // (backward write-time within the partition). The stale event
                // is skipped by the destination's version dedup; the stored
                // timestamp stays put.
                let ts = last_event_timestamp_micros.max(stored.last_event_timestamp_micros);
                let next = stored.advanced(log, ts, delta)?;
                Ok(Advance::Advanced(next))
            }
        }
    }

    /// Record an acknowledged offset.
    pub async fn commit(&self, offset: ReplicationOffset) {
        self.offsets
            .write()
            .await
            .insert(offset.key.clone(), offset);
    }

    /// All offsets for one table across partitions and destinations.
    pub async fn all_for(&self, table: &str, keyspace: &str) -> Vec<ReplicationOffset> {
        self.offsets
            .read()
            .await
            .values()
            .filter(|o| o.key.table == table && o.key.keyspace == keyspace)
            .cloned()
            .collect()
    }

    /// Earliest committed position across every tracked key, which is where
    /// a restart must resume from to replay all uncommitted work.
    pub async fn min_position(&self) -> Option<LogPosition> {
        self.offsets
            .read()
            .await
            .values()
            .map(|o| o.log.clone())
            .min()
    }

    /// Parameterized upsert for the relational-family offsets table.
    ///
    /// The guard clause makes the statement a no-op unless the new
    /// `(file, position)` is strictly greater, so replayed batches cannot
    /// move an offset backwards even at the SQL level. Parameters:
    /// `$1` offset_id, `$2` table_name, `$3` keyspace, `$4` partition_id,
    /// `$5` destination, `$6` commitlog_file, `$7` commitlog_position,
    /// `$8` last_event_timestamp_micros, `$9` last_committed_at,
    /// `$10` events_replicated_count.
    pub fn relational_upsert_sql() -> String {
        format!(
            "INSERT INTO {OFFSETS_TABLE} (\
                offset_id, table_name, keyspace, partition_id, destination, \
                commitlog_file, commitlog_position, last_event_timestamp_micros, \
                last_committed_at, events_replicated_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (table_name, keyspace, partition_id, destination) DO UPDATE SET \
                commitlog_file = EXCLUDED.commitlog_file, \
                commitlog_position = EXCLUDED.commitlog_position, \
                last_event_timestamp_micros = EXCLUDED.last_event_timestamp_micros, \
                last_committed_at = EXCLUDED.last_committed_at, \
                events_replicated_count = EXCLUDED.events_replicated_count \
             WHERE ({OFFSETS_TABLE}.commitlog_file, {OFFSETS_TABLE}.commitlog_position) \
                 < (EXCLUDED.commitlog_file, EXCLUDED.commitlog_position)"
        )
    }

    /// Insert for the columnar offsets table. Deduplication is the engine's:
    /// the table is keyed on `(destination, partition_id, table_name,
    /// keyspace)` with `last_event_timestamp_micros` as the merge version.
    pub fn columnar_insert_sql(database: &str) -> String {
        format!(
            "INSERT INTO {database}.{OFFSETS_TABLE} (\
                offset_id, table_name, keyspace, partition_id, destination, \
                commitlog_file, commitlog_position, last_event_timestamp_micros, \
                last_committed_at, events_replicated_count)"
        )
    }
}
