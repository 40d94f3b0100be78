//! PostgreSQL warehouse sink.
//!
//! One transaction per batch: upsert each event by primary key
//! (`INSERT ... ON CONFLICT (<pk>) DO UPDATE SET ...`), apply deletes by
//! primary key, then upsert the offset row with the monotone guard clause,
//! then commit. The commit is the acknowledgement; any failure rolls the
//! whole batch back and the orchestrator retries or dead-letters it.
//!
//! Connections come from a small checkout pool sized for the destination's
//! worker count plus headroom, so parallel workers write without contending
//! on one session. Pool acquisition is a suspension point with a timeout.

use crate::config::DestinationConfig;
use crate::error::{ConnectorError, Result};
use crate::mapper::TypeMapper;
use crate::sinks::{
    estimate_event_bytes, validate_identifier, Sink, SinkCounters, SinkStats, WriteResult,
};
use async_trait::async_trait;
use cassflow_cdc::OffsetManager;
use cassflow_core::{
    ChangeEvent, ChangeOp, CqlType, CqlValue, Destination, EventKind, LogPosition, OffsetKey,
    ReplicationOffset, SchemaChange,
};
use chrono::DateTime;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

type SqlParam = Box<dyn ToSql + Send + Sync>;

/// Checkout pool of destination connections.
///
/// `permits` tracks idle connections: a connection is pushed before its
/// permit is added, so a granted permit guarantees a poppable client.
struct ConnectionPool {
    idle: Mutex<Vec<Client>>,
    permits: Semaphore,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    fn new(acquire_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(0),
            acquire_timeout,
        }
    }

    async fn put(&self, client: Client) {
        self.idle.lock().await.push(client);
        self.permits.add_permits(1);
    }

    async fn acquire(&self) -> Result<Client> {
        let permit = timeout(self.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| ConnectorError::timeout("waiting for a pooled connection"))?
            .map_err(|_| ConnectorError::connection("connection pool closed"))?;
        permit.forget();
        Ok(self
            .idle
            .lock()
            .await
            .pop()
            .expect("permit guarantees an idle connection"))
    }

    async fn drain(&self) -> usize {
        let mut idle = self.idle.lock().await;
        let drained = idle.len();
        // permits for drained connections are intentionally not restored
        self.permits.forget_permits(drained);
        idle.clear();
        drained
    }
}

/// Sink for the relational warehouse (and, via
/// [`PostgresSink::with_destination`], its time-series variant).
pub struct PostgresSink {
    destination: Destination,
    config: DestinationConfig,
    pool_size: usize,
    pool: ConnectionPool,
    counters: SinkCounters,
}

impl PostgresSink {
    pub fn new(config: DestinationConfig, pool_size: usize) -> Self {
        Self::with_destination(config, pool_size, Destination::Postgres)
    }

    pub fn with_destination(
        config: DestinationConfig,
        pool_size: usize,
        destination: Destination,
    ) -> Self {
        let acquire_timeout = Duration::from_millis(config.connect_timeout_ms);
        Self {
            destination,
            config,
            pool_size: pool_size.max(1),
            pool: ConnectionPool::new(acquire_timeout),
            counters: SinkCounters::new(),
        }
    }

    async fn open_connection(&self) -> Result<Client> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.database)
            .user(&self.config.user)
            .password(&self.config.password)
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms));

        let (client, connection) =
            timeout(Duration::from_millis(self.config.connect_timeout_ms), pg.connect(NoTls))
                .await
                .map_err(|_| {
                    ConnectorError::timeout(format!(
                        "connecting to {}:{}",
                        self.config.host, self.config.port
                    ))
                })??;

        let destination = self.destination;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(destination = %destination, error = %e, "postgres connection task ended");
            }
        });
        Ok(client)
    }

    fn mapper(&self) -> TypeMapper {
        TypeMapper::new(self.destination)
    }

    fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.config.statement_timeout_ms)
    }

    /// Return a connection to the pool, replacing it when the last
    /// operation on it failed (failed sessions may be wedged mid-protocol).
    async fn recycle(&self, client: Client, failed: bool) {
        if !failed {
            self.pool.put(client).await;
            return;
        }
        drop(client);
        match self.open_connection().await {
            Ok(fresh) => self.pool.put(fresh).await,
            Err(e) => warn!(
                destination = %self.destination,
                error = %e,
                "could not replace broken pooled connection"
            ),
        }
    }

    async fn write_batch_tx(
        &self,
        events: &[ChangeEvent],
        offset: &ReplicationOffset,
    ) -> Result<WriteResult> {
        let mut client = self.pool.acquire().await?;
        let result = run_batch(&mut client, events, offset).await;
        self.recycle(client, result.is_err()).await;

        let result = result?;
        debug!(
            destination = %self.destination,
            events = result.events_written,
            position = %offset.log,
            "batch committed"
        );
        Ok(result)
    }
}

/// Borrow boxed parameters for the wire; the driver's parameter trait is
/// implemented for `&dyn ToSql`, not for the boxes themselves.
fn borrowed(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Execute the whole batch protocol on one session: event upserts/deletes,
/// the guarded offset upsert, then commit.
async fn run_batch(
    client: &mut Client,
    events: &[ChangeEvent],
    offset: &ReplicationOffset,
) -> Result<WriteResult> {
    let tx = client.transaction().await?;

    let mut written = 0u64;
    let mut bytes = 0u64;
    for event in events {
        validate_identifier(event.table())?;
        match event.kind() {
            EventKind::Delete => {
                let (sql, params) = delete_statement(event)?;
                tx.execute_raw(sql.as_str(), borrowed(&params)).await?;
            }
            EventKind::Insert | EventKind::Update => {
                let (sql, params) = upsert_statement(event)?;
                tx.execute_raw(sql.as_str(), borrowed(&params)).await?;
            }
        }
        written += 1;
        bytes += estimate_event_bytes(event) as u64;
    }

    let sql = OffsetManager::relational_upsert_sql();
    let params = offset_params(offset);
    tx.execute_raw(sql.as_str(), borrowed(&params)).await?;
    tx.commit().await?;
    Ok(WriteResult::new(written, bytes))
}

#[async_trait]
impl Sink for PostgresSink {
    fn destination(&self) -> Destination {
        self.destination
    }

    async fn connect(&self) -> Result<()> {
        self.pool.drain().await;
        for _ in 0..self.pool_size {
            let client = self.open_connection().await?;
            self.pool.put(client).await;
        }
        info!(
            destination = %self.destination,
            host = %self.config.host,
            database = %self.config.database,
            pool_size = self.pool_size,
            "connected"
        );
        Ok(())
    }

    async fn close(&self) {
        if self.pool.drain().await > 0 {
            info!(destination = %self.destination, "disconnected");
        }
    }

    async fn write_batch(
        &self,
        events: &[ChangeEvent],
        offset: &ReplicationOffset,
    ) -> Result<WriteResult> {
        self.counters.batch_started();
        let result = match timeout(self.statement_timeout(), self.write_batch_tx(events, offset))
            .await
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
        let client = self.pool.acquire().await?;

        let mut outcome = Ok(());
        for column in &change.changes {
            if let Err(e) = validate_identifier(&column.column) {
                outcome = Err(e);
                break;
            }
            let Some(sql) = ddl_statement(&change.table, column, &mapper) else {
                warn!(
                    destination = %self.destination,
                    table = %change.table,
                    column = %column.column,
                    "no destination representation for column change, skipping DDL"
                );
                continue;
            };
            info!(destination = %self.destination, sql = %sql, "applying DDL");
            let applied = timeout(self.statement_timeout(), client.execute(sql.as_str(), &[]))
                .await
                .map_err(|_| ConnectorError::timeout("DDL statement"))
                .and_then(|r| r.map_err(ConnectorError::from));
            if let Err(e) = applied {
                outcome = Err(e);
                break;
            }
        }
        self.recycle(client, outcome.is_err()).await;
        outcome
    }

    async fn health_check(&self) -> Result<Duration> {
        let start = Instant::now();
        let client = self.pool.acquire().await?;
        let probed = timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            client.query_one("SELECT 1", &[]),
        )
        .await
        .map_err(|_| ConnectorError::timeout("health check"))
        .and_then(|r| r.map_err(ConnectorError::from));
        self.recycle(client, probed.is_err()).await;
        probed?;
        Ok(start.elapsed())
    }

    async fn load_offsets(&self) -> Result<Vec<ReplicationOffset>> {
        let client = self.pool.acquire().await?;

        let sql = format!(
            "SELECT offset_id, table_name, keyspace, partition_id, commitlog_file, \
             commitlog_position, last_event_timestamp_micros, last_committed_at, \
             events_replicated_count FROM {} WHERE destination = $1",
            cassflow_cdc::OFFSETS_TABLE
        );
        let queried = client
            .query(sql.as_str(), &[&self.destination.as_str()])
            .await;
        self.recycle(client, queried.is_err()).await;
        let rows = match queried {
            Ok(rows) => rows,
            // First start against a fresh warehouse: offsets table not
            // bootstrapped yet means no progress to recover.
            Err(e)
                if e.as_db_error()
                    .is_some_and(|db| db.code().code() == "42P01") =>
            {
                warn!(destination = %self.destination, "offsets table missing, starting fresh");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut offsets = Vec::with_capacity(rows.len());
        for row in rows {
            offsets.push(ReplicationOffset {
                offset_id: row.get(0),
                key: OffsetKey::new(
                    row.get::<_, String>(1),
                    row.get::<_, String>(2),
                    row.get::<_, i64>(3),
                    self.destination,
                ),
                log: LogPosition::new(row.get::<_, String>(4), row.get::<_, i64>(5) as u64),
                last_event_timestamp_micros: row.get(6),
                last_committed_at: row.get(7),
                events_replicated_count: row.get::<_, i64>(8) as u64,
            });
        }
        Ok(offsets)
    }

    fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }
}

/// DDL for one column change, or `None` when the destination cannot
/// represent the new type or the change was classified incompatible
/// (incompatible changes are handled by dead-lettering, not DDL).
fn ddl_statement(
    table: &str,
    column: &cassflow_core::ColumnChange,
    mapper: &TypeMapper,
) -> Option<String> {
    if column.compatibility == cassflow_core::Compatibility::Incompatible {
        return None;
    }
    match column.op {
        ChangeOp::Add => {
            let ty = mapper.map(column.new_type?)?;
            Some(format!(
                "ALTER TABLE \"{table}\" ADD COLUMN IF NOT EXISTS \"{}\" {ty}",
                column.column
            ))
        }
        ChangeOp::Drop => Some(format!(
            "ALTER TABLE \"{table}\" DROP COLUMN IF EXISTS \"{}\"",
            column.column
        )),
        ChangeOp::AlterType => {
            let ty = mapper.map(column.new_type?)?;
            Some(format!(
                "ALTER TABLE \"{table}\" ALTER COLUMN \"{col}\" TYPE {ty} USING \"{col}\"::{ty}",
                col = column.column
            ))
        }
    }
}

fn upsert_statement(event: &ChangeEvent) -> Result<(String, Vec<SqlParam>)> {
    let mut names: Vec<&str> = Vec::new();
    let mut params: Vec<SqlParam> = Vec::new();
    for cell in event.primary_key().chain(event.columns().iter()) {
        validate_identifier(&cell.name)?;
        names.push(&cell.name);
        params.push(sql_param(cell.cql_type, &cell.value)?);
    }

    let pk_names: Vec<&str> = event.primary_key().map(|c| c.name.as_str()).collect();
    let column_list = names
        .iter()
        .map(|n| format!("\"{n}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=names.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let conflict_cols = pk_names
        .iter()
        .map(|n| format!("\"{n}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = names
        .iter()
        .filter(|n| !pk_names.contains(n))
        .map(|n| format!("\"{n}\" = EXCLUDED.\"{n}\""))
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    let sql = format!(
        "INSERT INTO \"{table}\" ({column_list}) VALUES ({placeholders}) \
         ON CONFLICT ({conflict_cols}) {action}",
        table = event.table()
    );
    Ok((sql, params))
}

fn delete_statement(event: &ChangeEvent) -> Result<(String, Vec<SqlParam>)> {
    let mut conditions = Vec::new();
    let mut params: Vec<SqlParam> = Vec::new();
    for (i, cell) in event.primary_key().enumerate() {
        validate_identifier(&cell.name)?;
        conditions.push(format!("\"{}\" = ${}", cell.name, i + 1));
        params.push(sql_param(cell.cql_type, &cell.value)?);
    }
    let sql = format!(
        "DELETE FROM \"{table}\" WHERE {}",
        conditions.join(" AND "),
        table = event.table()
    );
    Ok((sql, params))
}

fn offset_params(offset: &ReplicationOffset) -> Vec<SqlParam> {
    vec![
        Box::new(offset.offset_id),
        Box::new(offset.key.table.clone()),
        Box::new(offset.key.keyspace.clone()),
        Box::new(offset.key.partition_id),
        Box::new(offset.key.destination.as_str()),
        Box::new(offset.log.file.clone()),
        Box::new(offset.log.position as i64),
        Box::new(offset.last_event_timestamp_micros),
        Box::new(offset.last_committed_at),
        Box::new(offset.events_replicated_count as i64),
    ]
}

/// Convert one cell to a wire parameter, with a typed null so the driver's
/// type check passes for absent values.
fn sql_param(cql_type: CqlType, value: &CqlValue) -> Result<SqlParam> {
    if value.is_null() {
        return Ok(match cql_type {
            CqlType::Int => Box::new(None::<i32>),
            CqlType::BigInt | CqlType::Counter => Box::new(None::<i64>),
            CqlType::Float => Box::new(None::<f32>),
            CqlType::Double | CqlType::Decimal => Box::new(None::<f64>),
            CqlType::Boolean => Box::new(None::<bool>),
            CqlType::Uuid => Box::new(None::<uuid::Uuid>),
            CqlType::Timestamp => Box::new(None::<DateTime<chrono::Utc>>),
            CqlType::Blob => Box::new(None::<Vec<u8>>),
            CqlType::List | CqlType::Set | CqlType::Map | CqlType::Tuple => {
                Box::new(None::<serde_json::Value>)
            }
            CqlType::Text => Box::new(None::<String>),
        });
    }

    Ok(match value {
        CqlValue::Null => unreachable!(),
        CqlValue::Text(s) => Box::new(s.clone()),
        CqlValue::Int(v) => Box::new(*v),
        CqlValue::BigInt(v) | CqlValue::Counter(v) => Box::new(*v),
        CqlValue::Float(v) => Box::new(*v),
        CqlValue::Double(v) => Box::new(*v),
        CqlValue::Decimal(s) => Box::new(s.parse::<f64>().map_err(|_| {
            ConnectorError::Content(format!("unparseable decimal value: {s:?}"))
        })?),
        CqlValue::Boolean(v) => Box::new(*v),
        CqlValue::Uuid(u) => Box::new(*u),
        CqlValue::Timestamp(us) => Box::new(
            DateTime::from_timestamp_micros(*us).ok_or_else(|| {
                ConnectorError::Content(format!("timestamp out of range: {us}"))
            })?,
        ),
        CqlValue::Blob(b) => Box::new(b.clone()),
        composite @ (CqlValue::List(_)
        | CqlValue::Set(_)
        | CqlValue::Map(_)
        | CqlValue::Tuple(_)) => Box::new(composite.to_json()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cassflow_core::{Column, Compatibility, Row};
    use uuid::Uuid;

    fn insert_event() -> ChangeEvent {
        ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            Row::from_columns(vec![Column::new(
                "user_id",
                CqlType::Uuid,
                CqlValue::Uuid(Uuid::from_u128(1)),
            )]),
            Row::new(),
            Row::from_columns(vec![
                Column::new("email", CqlType::Text, CqlValue::Text("a@b.com".into())),
                Column::new("age", CqlType::Int, CqlValue::Int(30)),
            ]),
            1_700_000_000_000_000,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_upsert_statement_shape() {
        let (sql, params) = upsert_statement(&insert_event()).unwrap();
        assert!(sql.starts_with("INSERT INTO \"users\" (\"user_id\", \"email\", \"age\")"));
        assert!(sql.contains("ON CONFLICT (\"user_id\")"));
        assert!(sql.contains("\"email\" = EXCLUDED.\"email\""));
        assert!(sql.contains("\"age\" = EXCLUDED.\"age\""));
        assert!(!sql.contains("\"user_id\" = EXCLUDED"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_upsert_all_key_columns_does_nothing_on_conflict() {
        let event = ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "memberships",
            Row::from_columns(vec![Column::new(
                "user_id",
                CqlType::Uuid,
                CqlValue::Uuid(Uuid::from_u128(1)),
            )]),
            Row::new(),
            Row::from_columns(vec![Column::new(
                "user_id",
                CqlType::Uuid,
                CqlValue::Uuid(Uuid::from_u128(1)),
            )]),
            1,
            None,
        )
        .unwrap();
        let (sql, _) = upsert_statement(&event).unwrap();
        assert!(sql.ends_with("DO NOTHING"));
    }

    #[test]
    fn test_delete_statement_uses_primary_key() {
        let event = ChangeEvent::new(
            EventKind::Delete,
            "ecommerce",
            "users",
            Row::from_columns(vec![Column::new(
                "user_id",
                CqlType::Uuid,
                CqlValue::Uuid(Uuid::from_u128(1)),
            )]),
            Row::from_columns(vec![Column::new(
                "ts",
                CqlType::Timestamp,
                CqlValue::Timestamp(5),
            )]),
            Row::new(),
            1,
            None,
        )
        .unwrap();
        let (sql, params) = delete_statement(&event).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM \"users\" WHERE \"user_id\" = $1 AND \"ts\" = $2"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_hostile_identifier_rejected() {
        let event = ChangeEvent::new(
            EventKind::Insert,
            "ecommerce",
            "users",
            Row::from_columns(vec![Column::new(
                "user_id; DROP TABLE users",
                CqlType::Int,
                CqlValue::Int(1),
            )]),
            Row::new(),
            Row::from_columns(vec![Column::new("age", CqlType::Int, CqlValue::Int(1))]),
            1,
            None,
        )
        .unwrap();
        assert!(upsert_statement(&event).is_err());
    }

    #[test]
    fn test_ddl_statements() {
        let mapper = TypeMapper::new(Destination::Postgres);
        let add = cassflow_core::ColumnChange {
            op: ChangeOp::Add,
            column: "city".into(),
            old_type: None,
            new_type: Some(CqlType::Text),
            compatibility: Compatibility::Compatible,
        };
        assert_eq!(
            ddl_statement("users", &add, &mapper).unwrap(),
            "ALTER TABLE \"users\" ADD COLUMN IF NOT EXISTS \"city\" text"
        );

        let drop = cassflow_core::ColumnChange {
            op: ChangeOp::Drop,
            column: "age".into(),
            old_type: Some(CqlType::Int),
            new_type: None,
            compatibility: Compatibility::Compatible,
        };
        assert_eq!(
            ddl_statement("users", &drop, &mapper).unwrap(),
            "ALTER TABLE \"users\" DROP COLUMN IF EXISTS \"age\""
        );

        let alter = cassflow_core::ColumnChange {
            op: ChangeOp::AlterType,
            column: "age".into(),
            old_type: Some(CqlType::Int),
            new_type: Some(CqlType::BigInt),
            compatibility: Compatibility::Compatible,
        };
        assert_eq!(
            ddl_statement("users", &alter, &mapper).unwrap(),
            "ALTER TABLE \"users\" ALTER COLUMN \"age\" TYPE bigint USING \"age\"::bigint"
        );

        // a column type with no destination representation yields no DDL
        let add_counter = cassflow_core::ColumnChange {
            op: ChangeOp::Add,
            column: "visits".into(),
            old_type: None,
            new_type: Some(CqlType::Counter),
            compatibility: Compatibility::Compatible,
        };
        assert!(ddl_statement("users", &add_counter, &mapper).is_none());
    }

    #[test]
    fn test_sql_param_conversions() {
        // representative conversions; failures are type-level, success is
        // enough here
        assert!(sql_param(CqlType::Int, &CqlValue::Int(1)).is_ok());
        assert!(sql_param(CqlType::Uuid, &CqlValue::Uuid(Uuid::nil())).is_ok());
        assert!(sql_param(
            CqlType::Timestamp,
            &CqlValue::Timestamp(1_700_000_000_000_000)
        )
        .is_ok());
        assert!(sql_param(CqlType::Decimal, &CqlValue::Decimal("1.25".into())).is_ok());
        assert!(sql_param(CqlType::Decimal, &CqlValue::Decimal("abc".into())).is_err());
        assert!(sql_param(CqlType::Int, &CqlValue::Null).is_ok());
        assert!(sql_param(
            CqlType::Map,
            &CqlValue::Map(vec![(
                CqlValue::Text("k".into()),
                CqlValue::Int(1)
            )])
        )
        .is_ok());
    }
}
