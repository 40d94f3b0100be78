//! ClickHouse warehouse sink.
//!
//! No multi-statement transactions here: the destination tables use a
//! deduplicating merge engine keyed on primary key with `event_version`
//! (the source microsecond timestamp) as the merge version and `is_deleted`
//! as the tombstone flag, so later versions win on merge. The write
//! sequence is data insert first, then the offset insert; acknowledgement
//! means both returned OK. A crash between the two replays the batch and
//! the merge engine converges, which keeps the exactly-once guarantee in
//! terms of final converged state.
//!
//! Reads immediately after a write may see duplicates until the engine
//! merges parts; that is expected and documented behavior for this
//! destination.

use crate::config::DestinationConfig;
use crate::error::{ConnectorError, Result};
use crate::mapper::TypeMapper;
use crate::sinks::{
    estimate_event_bytes, validate_identifier, Sink, SinkCounters, SinkStats, WriteResult,
};
use async_trait::async_trait;
use cassflow_cdc::OffsetManager;
use cassflow_core::{
    ChangeEvent, ChangeOp, CqlValue, Destination, EventKind, ReplicationOffset, SchemaChange,
};
use clickhouse::Client;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Merge-version column carried on every replicated row.
const VERSION_COLUMN: &str = "event_version";
/// Tombstone flag column; deletes insert a row with this set.
const DELETED_COLUMN: &str = "is_deleted";

/// How many narrowing column rewrites may run at once across tables.
/// `MODIFY COLUMN` to a narrower type rewrites every part of the table; the
/// engine does it asynchronously without blocking other tables, this bound
/// just keeps the mutation queue shallow.
const MAX_CONCURRENT_REWRITES: usize = 2;

/// Sink for the columnar analytic store.
pub struct ClickhouseSink {
    config: DestinationConfig,
    client: Mutex<Option<Client>>,
    rewrites: Semaphore,
    counters: SinkCounters,
}

impl ClickhouseSink {
    pub fn new(config: DestinationConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            rewrites: Semaphore::new(MAX_CONCURRENT_REWRITES),
            counters: SinkCounters::new(),
        }
    }

    fn mapper(&self) -> TypeMapper {
        TypeMapper::new(Destination::Clickhouse)
    }

    fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.config.statement_timeout_ms)
    }

    /// Clone the shared client out of the slot; the handle multiplexes a
    /// pooled HTTP transport, so clones are cheap and workers never contend
    /// on the lock across a network call.
    async fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| ConnectorError::connection("clickhouse sink not connected"))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .query(sql)
            .execute()
            .await
            .map_err(|e| ConnectorError::clickhouse(e.to_string()))
    }

    async fn write_batch_inner(
        &self,
        events: &[ChangeEvent],
        offset: &ReplicationOffset,
    ) -> Result<WriteResult> {
        let mut written = 0u64;
        let mut bytes = 0u64;

        // Data first. The offset row goes second so a failure in between
        // replays data the merge engine deduplicates, rather than recording
        // progress for rows that never landed.
        for sql in insert_statements(&self.config.database, events)? {
            self.execute(&sql).await?;
        }
        for event in events {
            written += 1;
            bytes += estimate_event_bytes(event) as u64;
        }

        self.execute(&offset_insert_sql(&self.config.database, offset))
            .await?;

        debug!(events = written, position = %offset.log, "batch acknowledged");
        Ok(WriteResult::new(written, bytes))
    }
}

#[async_trait]
impl Sink for ClickhouseSink {
    fn destination(&self) -> Destination {
        Destination::Clickhouse
    }

    async fn connect(&self) -> Result<()> {
        let url = format!("http://{}:{}", self.config.host, self.config.port);
        let client = Client::default()
            .with_url(&url)
            .with_database(&self.config.database)
            .with_user(&self.config.user)
            .with_password(&self.config.password);

        let probe = client.query("SELECT 1").fetch_one::<u8>();
        timeout(Duration::from_millis(self.config.connect_timeout_ms), probe)
            .await
            .map_err(|_| ConnectorError::timeout(format!("connecting to {url}")))?
            .map_err(|e| ConnectorError::clickhouse(e.to_string()))?;

        *self.client.lock().await = Some(client);
        info!(url = %url, database = %self.config.database, "connected");
        Ok(())
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            info!(destination = "CLICKHOUSE", "disconnected");
        }
    }

    async fn write_batch(
        &self,
        events: &[ChangeEvent],
        offset: &ReplicationOffset,
    ) -> Result<WriteResult> {
        self.counters.batch_started();
        let result =
            match timeout(self.statement_timeout(), self.write_batch_inner(events, offset)).await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::timeout(format!(
                    "batch write exceeded {}ms",
                    self.config.statement_timeout_ms
                ))),
            };
        match &result {
            Ok(r) => self.counters.record_written(r.events_written),
            Err(_) => self.counters.record_error(),
        }
        self.counters.batch_finished();
        result
    }

    async fn apply_schema_change(&self, change: &SchemaChange) -> Result<()> {
        validate_identifier(&change.table)?;
        let mapper = self.mapper();
        let table = format!("{}.{}", self.config.database, change.table);

        for column in &change.changes {
            validate_identifier(&column.column)?;
            // Incompatible changes are dead-lettered upstream, never DDL'd.
            if column.compatibility == cassflow_core::Compatibility::Incompatible {
                continue;
            }
            let sql = match column.op {
                ChangeOp::Add => {
                    let Some(ty) = column.new_type.and_then(|t| mapper.map(t)) else {
                        warn!(
                            table = %change.table,
                            column = %column.column,
                            "no columnar representation for added column, skipping DDL"
                        );
                        continue;
                    };
                    format!(
                        "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} Nullable({ty})",
                        column.column
                    )
                }
                ChangeOp::Drop => format!(
                    "ALTER TABLE {table} DROP COLUMN IF EXISTS {}",
                    column.column
                ),
                ChangeOp::AlterType => {
                    let Some(ty) = column.new_type.and_then(|t| mapper.map(t)) else {
                        warn!(
                            table = %change.table,
                            column = %column.column,
                            "no columnar representation for altered column, skipping DDL"
                        );
                        continue;
                    };
                    let widening = match (column.old_type, column.new_type) {
                        (Some(old), Some(new)) => mapper.is_widening(old, new),
                        _ => false,
                    };
                    let sql = format!(
                        "ALTER TABLE {table} MODIFY COLUMN {} Nullable({ty})",
                        column.column
                    );
                    if widening {
                        sql
                    } else {
                        // Narrowing forces a part-by-part rewrite inside the
                        // engine; bound how many run at once.
                        let _permit = self
                            .rewrites
                            .acquire()
                            .await
                            .map_err(|_| ConnectorError::fatal("rewrite semaphore closed"))?;
                        info!(table = %change.table, column = %column.column, "rewriting column");
                        self.execute(&sql).await?;
                        continue;
                    }
                }
            };
            info!(sql = %sql, "applying DDL");
            self.execute(&sql).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<Duration> {
        let start = Instant::now();
        let client = self.client().await?;
        let probe = client.query("SELECT 1").fetch_one::<u8>();
        timeout(Duration::from_millis(self.config.connect_timeout_ms), probe)
            .await
            .map_err(|_| ConnectorError::timeout("health check"))?
            .map_err(|e| ConnectorError::clickhouse(e.to_string()))?;
        Ok(start.elapsed())
    }

    async fn load_offsets(&self) -> Result<Vec<ReplicationOffset>> {
        let client = self.client().await?;

        let sql = format!(
            "SELECT toString(offset_id), table_name, keyspace, partition_id, commitlog_file, \
             commitlog_position, last_event_timestamp_micros, \
             toUnixTimestamp64Micro(last_committed_at), events_replicated_count \
             FROM {}.{} FINAL WHERE destination = 'CLICKHOUSE'",
            self.config.database,
            cassflow_cdc::OFFSETS_TABLE
        );
        let rows = match client.query(&sql).fetch_all::<OffsetRow>().await {
            Ok(rows) => rows,
            Err(e) if e.to_string().contains("UNKNOWN_TABLE") => {
                warn!("offsets table missing, starting fresh");
                return Ok(Vec::new());
            }
            Err(e) => return Err(ConnectorError::clickhouse(e.to_string())),
        };

        let mut offsets = Vec::with_capacity(rows.len());
        for row in rows {
            offsets.push(ReplicationOffset {
                offset_id: row
                    .offset_id
                    .parse()
                    .map_err(|_| ConnectorError::Content("corrupt offset_id".into()))?,
                key: cassflow_core::OffsetKey::new(
                    row.table_name,
                    row.keyspace,
                    row.partition_id,
                    Destination::Clickhouse,
                ),
                log: cassflow_core::LogPosition::new(row.commitlog_file, row.commitlog_position),
                last_event_timestamp_micros: row.last_event_timestamp_micros,
                last_committed_at: chrono::DateTime::from_timestamp_micros(
                    row.last_committed_at_micros,
                )
                .ok_or_else(|| ConnectorError::Content("corrupt last_committed_at".into()))?,
                events_replicated_count: row.events_replicated_count,
            });
        }
        Ok(offsets)
    }

    fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }
}

/// Wire row of the offsets recovery query.
#[derive(clickhouse::Row, serde::Deserialize)]
struct OffsetRow {
    offset_id: String,
    table_name: String,
    keyspace: String,
    partition_id: i64,
    commitlog_file: String,
    commitlog_position: u64,
    last_event_timestamp_micros: i64,
    last_committed_at_micros: i64,
    events_replicated_count: u64,
}

/// Render batched `INSERT` statements, one per distinct column list.
///
/// Upserts carry every cell plus the version column; deletes carry the
/// primary key, the version, and the tombstone flag. Events with identical
/// column lists share one multi-row insert.
fn insert_statements(database: &str, events: &[ChangeEvent]) -> Result<Vec<String>> {
    // (table, column list) → rendered value tuples, insertion-ordered
    let mut groups: Vec<((String, Vec<String>), Vec<String>)> = Vec::new();

    for event in events {
        validate_identifier(event.table())?;
        let mut names = Vec::new();
        let mut values = Vec::new();

        for cell in event.primary_key() {
            validate_identifier(&cell.name)?;
            names.push(cell.name.clone());
            values.push(literal(&cell.value));
        }
        if event.kind() != EventKind::Delete {
            for cell in event.columns() {
                validate_identifier(&cell.name)?;
                names.push(cell.name.clone());
                values.push(literal(&cell.value));
            }
        }
        names.push(VERSION_COLUMN.to_string());
        values.push(event.timestamp_micros().to_string());
        names.push(DELETED_COLUMN.to_string());
        let tombstone = if event.kind() == EventKind::Delete { "1" } else { "0" };
        values.push(tombstone.to_string());

        let key = (event.table().to_string(), names);
        let tuple = format!("({})", values.join(", "));
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, tuples)) => tuples.push(tuple),
            None => groups.push((key, vec![tuple])),
        }
    }

    Ok(groups
        .into_iter()
        .map(|((table, names), tuples)| {
            format!(
                "INSERT INTO {database}.{table} ({}) VALUES {}",
                names.join(", "),
                tuples.join(", ")
            )
        })
        .collect())
}

fn offset_insert_sql(database: &str, offset: &ReplicationOffset) -> String {
    format!(
        "{} VALUES ('{}', {}, {}, {}, '{}', {}, {}, {}, {}, {})",
        OffsetManager::columnar_insert_sql(database),
        offset.offset_id,
        quoted(&offset.key.table),
        quoted(&offset.key.keyspace),
        offset.key.partition_id,
        offset.key.destination.as_str(),
        quoted(&offset.log.file),
        offset.log.position,
        offset.last_event_timestamp_micros,
        datetime_literal(offset.last_committed_at.timestamp_micros()),
        offset.events_replicated_count
    )
}

/// Render one value as a ClickHouse literal.
fn literal(value: &CqlValue) -> String {
    match value {
        CqlValue::Null => "NULL".to_string(),
        CqlValue::Text(s) | CqlValue::Decimal(s) => quoted(s),
        CqlValue::Int(v) => v.to_string(),
        CqlValue::BigInt(v) | CqlValue::Counter(v) => v.to_string(),
        CqlValue::Float(v) => v.to_string(),
        CqlValue::Double(v) => v.to_string(),
        CqlValue::Boolean(v) => if *v { "true" } else { "false" }.to_string(),
        CqlValue::Uuid(u) => format!("'{u}'"),
        CqlValue::Timestamp(us) => datetime_literal(*us),
        CqlValue::Blob(b) => format!("unhex('{}')", hex::encode(b)),
        composite @ (CqlValue::List(_)
        | CqlValue::Set(_)
        | CqlValue::Map(_)
        | CqlValue::Tuple(_)) => quoted(&composite.to_json().to_string()),
    }
}

fn quoted(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn datetime_literal(micros: i64) -> String {
    format!(
        "toDateTime64({}.{:06}, 6, 'UTC')",
        micros.div_euclid(1_000_000),
        micros.rem_euclid(1_000_000)
    )
}
