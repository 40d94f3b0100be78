//! Destination sinks.
//!
//! Every sink implements [`Sink`]: connect, batched idempotent writes that
//! commit atomically (or, for the columnar store, in data-then-offset order)
//! with the offset update, schema-change DDL, and a health probe. All writes
//! are idempotent at the `(event id, primary key)` granularity, which is
//! what makes batch replay safe.

mod clickhouse;
mod memory;
mod postgres;
mod timescale;

pub use clickhouse::ClickhouseSink;
pub use memory::MemorySink;
pub use postgres::PostgresSink;
pub use timescale::TimescaleSink;

use crate::error::Result;
use async_trait::async_trait;
use cassflow_core::{ChangeEvent, Destination, ReplicationOffset, SchemaChange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Result of one batch write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Rows written (upserts plus deletes applied)
    pub events_written: u64,
    /// Approximate bytes shipped
    pub bytes_written: u64,
}

impl WriteResult {
    pub fn new(events_written: u64, bytes_written: u64) -> Self {
        Self {
            events_written,
            bytes_written,
        }
    }
}

/// Point-in-time sink statistics.
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    pub events_written: u64,
    pub errors: u64,
    pub in_flight_batches: u64,
    pub events_per_second: f64,
}

/// Shared counters every sink embeds; throughput is a windowed rate over
/// roughly the last second of writes.
#[derive(Debug)]
pub struct SinkCounters {
    events_written: AtomicU64,
    errors: AtomicU64,
    in_flight_batches: AtomicU64,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u64,
    last_rate: f64,
}

impl Default for SinkCounters {
    fn default() -> Self {
        Self {
            events_written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            in_flight_batches: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                started: Instant::now(),
                count: 0,
                last_rate: 0.0,
            }),
        }
    }
}

impl SinkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_started(&self) {
        self.in_flight_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_finished(&self) {
        self.in_flight_batches.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_written(&self, events: u64) {
        self.events_written.fetch_add(events, Ordering::Relaxed);
        let mut window = self.window.lock().expect("rate window poisoned");
        window.count += events;
        let elapsed = window.started.elapsed();
        if elapsed >= Duration::from_secs(1) {
            window.last_rate = window.count as f64 / elapsed.as_secs_f64();
            window.started = Instant::now();
            window.count = 0;
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SinkStats {
        let rate = {
            let mut window = self.window.lock().expect("rate window poisoned");
            let elapsed = window.started.elapsed();
            if elapsed >= Duration::from_secs(1) {
                window.last_rate = window.count as f64 / elapsed.as_secs_f64();
                window.started = Instant::now();
                window.count = 0;
            }
            window.last_rate
        };
        SinkStats {
            events_written: self.events_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            in_flight_batches: self.in_flight_batches.load(Ordering::Relaxed),
            events_per_second: rate,
        }
    }
}

/// A destination warehouse.
///
/// `write_batch` receives a contiguous run of events from one partition plus
/// the offset the run advances to; its success is the definition of
/// "acknowledged" for those events. An empty event slice is an offset-only
/// write (used to advance past dead-lettered events).
#[async_trait]
pub trait Sink: Send + Sync {
    fn destination(&self) -> Destination;

    /// Establish the destination connection.
    async fn connect(&self) -> Result<()>;

    /// Release the destination connection. Idempotent.
    async fn close(&self);

    /// Atomically write a batch and advance the offset.
    async fn write_batch(
        &self,
        events: &[ChangeEvent],
        offset: &ReplicationOffset,
    ) -> Result<WriteResult>;

    /// Apply DDL equivalent to the source schema diff.
    async fn apply_schema_change(&self, change: &SchemaChange) -> Result<()>;

    /// Probe the destination; returns observed latency.
    async fn health_check(&self) -> Result<Duration>;

    /// Offsets committed at this destination, read once at startup (and on
    /// sink rebind) to seed the offset manager.
    async fn load_offsets(&self) -> Result<Vec<ReplicationOffset>> {
        Ok(Vec::new())
    }

    fn stats(&self) -> SinkStats;
}

/// Approximate wire size of one event, used for byte-bounded batching and
/// throughput accounting.
pub fn estimate_event_bytes(event: &ChangeEvent) -> usize {
    let mut size = 64; // fixed header: id, kind, names, timestamps
    size += event.partition_key().canonical_bytes().len();
    size += event.clustering_key().canonical_bytes().len();
    size += event.columns().canonical_bytes().len();
    size
}

/// Reject identifiers that cannot be safely embedded in DDL/DML.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(crate::error::ConnectorError::Content(format!(
            "invalid identifier: {name:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = SinkCounters::new();
        counters.batch_started();
        counters.record_written(10);
        counters.record_error();

        let stats = counters.snapshot();
        assert_eq!(stats.events_written, 10);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.in_flight_batches, 1);

        counters.batch_finished();
        assert_eq!(counters.snapshot().in_flight_batches, 0);
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("user_events_2024").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1users").is_err());
        assert!(validate_identifier("users; drop table x").is_err());
        assert!(validate_identifier("users\"").is_err());
    }
}
